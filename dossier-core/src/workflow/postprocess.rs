//! Deterministic citation clean-up applied to a synthesized brief.
//!
//! Markers never resolve to invented references: a `[n]` with no
//! reference behind it is removed. Surviving references are renumbered in
//! the order they are first cited (narrative, then key findings) and
//! uncited references follow the cited ones.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::warn;

use crate::types::FinalBrief;

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{1,4})\]").expect("citation pattern is valid"));

static CITATION_WITH_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\s*)\[(\d{1,4})\]").expect("citation pattern is valid"));

/// Citation numbers in `text`, in order of appearance.
pub fn cited_indices(text: &str) -> Vec<usize> {
    CITATION
        .captures_iter(text)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Strip unresolved markers and renumber references. Returns the number of
/// markers removed.
pub fn enforce_citations(brief: &mut FinalBrief) -> usize {
    let known: HashSet<usize> = brief.references.iter().map(|r| r.index).collect();
    let mut stripped = 0usize;

    let mut strip = |text: &str| -> String {
        CITATION_WITH_SPACE
            .replace_all(text, |c: &Captures| {
                let keep = c[2].parse::<usize>().is_ok_and(|n| known.contains(&n));
                if keep {
                    c[0].to_string()
                } else {
                    stripped += 1;
                    String::new()
                }
            })
            .trim()
            .to_string()
    };

    brief.narrative = strip(&brief.narrative);
    brief.key_findings = brief
        .key_findings
        .iter()
        .map(|f| strip(f))
        .filter(|f| !f.is_empty())
        .collect();

    if stripped > 0 {
        warn!(
            run_id = %brief.metadata.run_id,
            stripped,
            "Removed citation markers without a matching reference"
        );
    }

    renumber(brief);
    stripped
}

fn renumber(brief: &mut FinalBrief) {
    let mut order: Vec<usize> = Vec::new();
    let texts = std::iter::once(&brief.narrative).chain(brief.key_findings.iter());
    for text in texts {
        for n in cited_indices(text) {
            if !order.contains(&n) {
                order.push(n);
            }
        }
    }

    let mut references = std::mem::take(&mut brief.references);
    references.sort_by_key(|r| {
        order
            .iter()
            .position(|&n| n == r.index)
            .unwrap_or(usize::MAX)
    });

    let mut mapping: HashMap<usize, usize> = HashMap::with_capacity(references.len());
    for (position, reference) in references.iter_mut().enumerate() {
        mapping.insert(reference.index, position + 1);
        reference.index = position + 1;
    }
    brief.references = references;

    let rewrite = |text: &str| -> String {
        CITATION
            .replace_all(text, |c: &Captures| {
                match c[1].parse::<usize>().ok().and_then(|n| mapping.get(&n)) {
                    Some(new) => format!("[{new}]"),
                    None => c[0].to_string(),
                }
            })
            .into_owned()
    };
    brief.narrative = rewrite(&brief.narrative);
    for finding in &mut brief.key_findings {
        *finding = rewrite(finding);
    }
}
