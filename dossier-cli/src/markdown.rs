//! Brief rendering: a markdown document for files and an ANSI view for terminals.

use dossier_core::FinalBrief;

/// ANSI escape codes for terminal formatting.
mod ansi {
    pub const BOLD_ON: &str = "\x1b[1m";
    pub const DIM_ON: &str = "\x1b[2m";
    pub const DIM_OFF: &str = "\x1b[22m";
    pub const CYAN: &str = "\x1b[36m";
    pub const RESET: &str = "\x1b[0m";
    pub const UNDERLINE_ON: &str = "\x1b[4m";
}

/// Render a brief as a standalone markdown document.
pub fn render_brief(brief: &FinalBrief) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", brief.query));
    out.push_str(brief.narrative.trim());
    out.push_str("\n\n");

    if !brief.key_findings.is_empty() {
        out.push_str("## Key findings\n\n");
        for finding in &brief.key_findings {
            out.push_str(&format!("- {finding}\n"));
        }
        out.push('\n');
    }

    out.push_str("## References\n\n");
    for reference in &brief.references {
        out.push_str(&format!(
            "{}. [{}]({})\n",
            reference.index, reference.title, reference.url
        ));
    }
    out.push('\n');

    let meta = &brief.metadata;
    out.push_str("---\n\n");
    out.push_str(&format!(
        "_Confidence {:.2} · {} search attempt(s) · generated {}_\n",
        meta.confidence,
        meta.search_attempts,
        meta.generated_at.format("%Y-%m-%d %H:%M UTC")
    ));
    if !meta.dropped_sources.is_empty() {
        out.push_str(&format!(
            "_{} source(s) dropped_\n",
            meta.dropped_sources.len()
        ));
    }
    out
}

/// Apply terminal formatting to a markdown document produced by [`render_brief`].
pub fn render_terminal(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len() + 128);
    for line in markdown.lines() {
        out.push_str(&render_line(line));
        out.push('\n');
    }
    out
}

fn render_line(line: &str) -> String {
    if let Some(heading) = line
        .strip_prefix("## ")
        .or_else(|| line.strip_prefix("# "))
    {
        return format!(
            "{}{}{}{}",
            ansi::BOLD_ON,
            ansi::UNDERLINE_ON,
            heading,
            ansi::RESET
        );
    }
    if line == "---" {
        return format!("{}{}{}", ansi::DIM_ON, "\u{2500}".repeat(40), ansi::DIM_OFF);
    }
    if let Some(rest) = line.strip_prefix("- ") {
        return format!("  \u{2022} {}", highlight_citations(rest));
    }
    if line.starts_with('_') && line.ends_with('_') && line.len() > 1 {
        return format!("{}{}{}", ansi::DIM_ON, &line[1..line.len() - 1], ansi::DIM_OFF);
    }
    highlight_citations(line)
}

/// Colour `[n]` citation markers.
fn highlight_citations(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 32);
    let mut rest = text;
    while let Some(start) = rest.find('[') {
        let (before, tail) = rest.split_at(start);
        out.push_str(before);
        let digits = tail[1..]
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(tail.len() - 1);
        if digits > 0 && tail[1 + digits..].starts_with(']') {
            let marker = &tail[..digits + 2];
            out.push_str(&format!("{}{}{}", ansi::CYAN, marker, ansi::RESET));
            rest = &tail[digits + 2..];
        } else {
            out.push('[');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dossier_core::Reference;
    use dossier_core::types::GenerationMetadata;

    fn sample_brief() -> FinalBrief {
        FinalBrief {
            query: "Effects of remote work".into(),
            narrative: "Productivity held steady [1] while commutes vanished [2].".into(),
            key_findings: vec!["Output unchanged [1]".into()],
            references: vec![
                Reference {
                    index: 1,
                    url: "https://a.example.org/study".into(),
                    title: "Study A".into(),
                    excerpt: String::new(),
                },
                Reference {
                    index: 2,
                    url: "https://b.example.org/survey".into(),
                    title: "Survey B".into(),
                    excerpt: String::new(),
                },
            ],
            metadata: GenerationMetadata {
                run_id: uuid::Uuid::nil(),
                session_id: None,
                generated_at: Utc::now(),
                stage_timings: vec![],
                retry_count: 0,
                search_attempts: 1,
                dropped_sources: vec![],
                confidence: 0.75,
                stripped_citations: 0,
                token_usage: Default::default(),
                processing_ms: 0,
            },
        }
    }

    #[test]
    fn test_render_brief_sections() {
        let md = render_brief(&sample_brief());
        assert!(md.starts_with("# Effects of remote work\n"));
        assert!(md.contains("## Key findings\n\n- Output unchanged [1]\n"));
        assert!(md.contains("1. [Study A](https://a.example.org/study)\n"));
        assert!(md.contains("2. [Survey B](https://b.example.org/survey)\n"));
        assert!(md.contains("Confidence 0.75"));
        assert!(!md.contains("dropped"));
    }

    #[test]
    fn test_render_brief_without_findings() {
        let mut brief = sample_brief();
        brief.key_findings.clear();
        let md = render_brief(&brief);
        assert!(!md.contains("## Key findings"));
    }

    #[test]
    fn test_highlight_citations() {
        let out = highlight_citations("a [1] b [x] c [23]");
        assert!(out.contains(&format!("{}[1]{}", ansi::CYAN, ansi::RESET)));
        assert!(out.contains(&format!("{}[23]{}", ansi::CYAN, ansi::RESET)));
        assert!(out.contains("[x]"));
    }

    #[test]
    fn test_unclosed_bracket_stays_literal() {
        assert_eq!(highlight_citations("trailing [12"), "trailing [12");
        assert_eq!(highlight_citations("["), "[");
    }

    #[test]
    fn test_render_terminal_headings_and_bullets() {
        let out = render_terminal("# Title\n- item [1]\n---\nplain");
        assert!(out.contains(&format!("{}{}Title", ansi::BOLD_ON, ansi::UNDERLINE_ON)));
        assert!(out.contains("\u{2022} item"));
        assert!(out.contains("\u{2500}"));
        assert!(out.ends_with("plain\n"));
    }
}
