//! Prompt builders for each model-backed stage.

use std::fmt::Write as _;

use crate::llm::Prompt;
use crate::schema::Contract;
use crate::types::{
    BriefRequest, ContextSummary, FetchedSource, ResearchDepth, ResearchPlan, RevisedQuery,
    SourceDigest, SourceSummary, SynthesisDraft, Turn, truncate_chars,
};

/// Source text offered to the summarizer per page.
const MAX_SOURCE_PROMPT_CHARS: usize = 3_000;

fn json_instruction(shape: &str) -> String {
    format!("Reply with only a JSON object of this shape:\n{shape}")
}

pub fn context_summary(request: &BriefRequest, history: &[Turn], max_chars: usize) -> Prompt {
    let mut user = String::from("Prior research in this session, oldest first:\n");
    for (i, turn) in history.iter().enumerate() {
        let _ = writeln!(user, "\n{}. Query: {}", i + 1, turn.request.query);
        for finding in turn.brief.key_findings.iter().take(5) {
            let _ = writeln!(user, "   - {finding}");
        }
    }
    let _ = write!(
        user,
        "\nNew query: {}\n\nSummarize what the user already knows that is relevant to the new \
         query in at most {max_chars} characters, and list the key insights.\n\n{}",
        request.query,
        json_instruction(ContextSummary::shape())
    );
    Prompt::new(
        "context_summary",
        "You condense a user's earlier research so a follow-up can build on it without repeating it.",
        user,
    )
}

pub fn plan(
    request: &BriefRequest,
    summary: &ContextSummary,
    depth: ResearchDepth,
    max_sub_queries: usize,
) -> Prompt {
    let budget = depth.sub_query_budget().min(max_sub_queries).max(1);
    let mut user = format!(
        "Research topic: {}\nResearch depth: {depth} ({}/3)\n\n\
         Break the topic into at most {budget} focused web search queries and name the key \
         focus areas.",
        request.query,
        depth.level()
    );
    if !summary.is_empty() {
        let _ = write!(user, "\n\nContext from earlier research:\n{}", summary.text);
        if !summary.previous_queries.is_empty() {
            let _ = write!(
                user,
                "\nPreviously researched: {}\nBuild on this and avoid repeating it.",
                summary.previous_queries.join("; ")
            );
        }
    }
    let _ = write!(user, "\n\n{}", json_instruction(ResearchPlan::shape()));
    Prompt::new(
        "plan",
        "You are a research planning expert. Plans lead to well-sourced research briefs.",
        user,
    )
}

pub fn revise_query(request: &BriefRequest, failed_query: &str, retry: u32) -> Prompt {
    let user = format!(
        "The web search `{failed_query}` returned no usable results (retry {retry}).\n\
         Original topic: {}\n\nWrite one broader or rephrased search query that is more likely \
         to find sources.\n\n{}",
        request.query,
        json_instruction(RevisedQuery::shape())
    );
    Prompt::new(
        "revise_query",
        "You rewrite web search queries that found nothing.",
        user,
    )
}

pub fn source_summary(topic: &str, source: &FetchedSource) -> Prompt {
    let user = format!(
        "Research topic: {topic}\nSource: {}\nURL: {}\nContent:\n{}\n\n\
         Extract the claims in this source that matter for the topic and rate your confidence \
         in the source between 0 and 1.\n\n{}",
        source.title,
        source.url,
        truncate_chars(&source.content, MAX_SOURCE_PROMPT_CHARS),
        json_instruction(SourceDigest::shape())
    );
    Prompt::new(
        "source_summary",
        "You analyze one source for a research brief. Be concise and only report what the source says.",
        user,
    )
}

pub fn synthesis(
    request: &BriefRequest,
    plan: Option<&ResearchPlan>,
    summaries: &[SourceSummary],
    context: &ContextSummary,
) -> Prompt {
    let mut sources = String::new();
    for (i, summary) in summaries.iter().enumerate() {
        let _ = writeln!(sources, "[{}] {} ({})", i + 1, summary.title, summary.url);
        for claim in &summary.claims {
            let _ = writeln!(sources, "    - {claim}");
        }
    }
    let mut user = format!(
        "Research topic: {}\n\nSources:\n{sources}\n\
         Write a research brief narrative and a list of key findings. Cite sources with their \
         bracketed number, e.g. [1]. Only cite the numbers listed above. Put the URL of every \
         source the brief relies on in cited_sources.",
        request.query
    );
    if let Some(plan) = plan
        && !plan.focus_areas.is_empty()
    {
        let _ = write!(user, "\n\nCover these focus areas: {}.", plan.focus_areas.join(", "));
    }
    if !context.previous_queries.is_empty() {
        let _ = write!(
            user,
            "\n\nThe user previously researched: {}. Build on that knowledge.",
            context.previous_queries.join("; ")
        );
    }
    let _ = write!(user, "\n\n{}", json_instruction(SynthesisDraft::shape()));
    Prompt::new(
        "synthesis",
        "You are an expert research analyst. Every claim must be supported by the cited sources.",
        user,
    )
}
