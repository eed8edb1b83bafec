//! Core data model for research briefs.
//!
//! Defines the records that flow between workflow stages: the incoming
//! request, plans, search results, source summaries and the final brief,
//! plus the session history kept by the context store.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FailureKind, RunFailure};
use crate::workflow::Stage;

/// How much ground a brief should cover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchDepth {
    /// A quick overview with few sub-queries.
    Shallow,
    /// Balanced coverage.
    #[default]
    Medium,
    /// Broad investigation across many angles.
    Deep,
}

impl ResearchDepth {
    /// Map the 1..=3 wire level onto a depth.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(ResearchDepth::Shallow),
            2 => Some(ResearchDepth::Medium),
            3 => Some(ResearchDepth::Deep),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            ResearchDepth::Shallow => 1,
            ResearchDepth::Medium => 2,
            ResearchDepth::Deep => 3,
        }
    }

    /// Number of sub-queries a plan at this depth should aim for.
    pub fn sub_query_budget(self) -> usize {
        match self {
            ResearchDepth::Shallow => 2,
            ResearchDepth::Medium => 3,
            ResearchDepth::Deep => 5,
        }
    }
}

impl std::fmt::Display for ResearchDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResearchDepth::Shallow => write!(f, "shallow"),
            ResearchDepth::Medium => write!(f, "medium"),
            ResearchDepth::Deep => write!(f, "deep"),
        }
    }
}

/// Optional bounds attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sources: Option<usize>,
}

/// An incoming request for a brief.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
}

impl BriefRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: None,
            constraints: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// The requested depth, falling back to the default.
    pub fn depth(&self) -> ResearchDepth {
        self.constraints
            .as_ref()
            .and_then(|c| c.depth)
            .and_then(ResearchDepth::from_level)
            .unwrap_or_default()
    }

    pub fn max_sources(&self) -> Option<usize> {
        self.constraints.as_ref().and_then(|c| c.max_sources)
    }

    /// Copy of the request with surrounding whitespace removed.
    pub fn normalized(&self) -> Self {
        Self {
            query: self.query.trim().to_string(),
            session_id: self.session_id.as_ref().map(|s| s.trim().to_string()),
            constraints: self.constraints.clone(),
        }
    }
}

/// Compressed prior context for a follow-up query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub text: String,
    #[serde(default)]
    pub previous_queries: Vec<String>,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub turn_count: usize,
}

impl ContextSummary {
    /// The deterministic summary used when a session has no history.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// The decomposition of a query into focused sub-queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub sub_queries: Vec<String>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub focus_areas: Vec<String>,
}

/// A single broadened query produced when a search comes back empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisedQuery {
    pub query: String,
}

/// One hit returned by a search provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl SearchResult {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        snippet: impl Into<String>,
        relevance: f64,
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            snippet: snippet.into(),
            relevance,
            provider: None,
        }
    }
}

/// Ordered, deduplicated search results for one run.
///
/// Results are sorted by descending relevance and hold unique URLs (compared
/// after [`normalize_url`]). An empty set is a valid value and drives the
/// retry branch of the workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchResultSet {
    results: Vec<SearchResult>,
}

impl SearchResultSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set from raw provider output.
    ///
    /// Non-http(s) URLs are dropped, relevance is clamped into `[0, 1]`,
    /// duplicates keep their highest-relevance entry and the result is
    /// truncated to `max_results`.
    pub fn from_results(results: Vec<SearchResult>, max_results: usize) -> Self {
        let mut results: Vec<SearchResult> = results
            .into_iter()
            .filter(|r| normalize_url(&r.url).is_some())
            .map(|mut r| {
                r.relevance = clamp_unit(r.relevance);
                r
            })
            .collect();
        results.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

        let mut seen = HashSet::new();
        results.retain(|r| normalize_url(&r.url).is_some_and(|key| seen.insert(key)));
        results.truncate(max_results);
        Self { results }
    }

    /// Merge per-sub-query sets into one.
    pub fn merge(sets: impl IntoIterator<Item = SearchResultSet>, max_results: usize) -> Self {
        let all = sets.into_iter().flat_map(|s| s.results).collect();
        Self::from_results(all, max_results)
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SearchResult> {
        self.results.iter()
    }

    pub fn results(&self) -> &[SearchResult] {
        &self.results
    }

    pub fn contains_url(&self, url: &str) -> bool {
        match normalize_url(url) {
            Some(key) => self
                .results
                .iter()
                .any(|r| normalize_url(&r.url).as_deref() == Some(key.as_str())),
            None => false,
        }
    }
}

/// Canonical form used to compare URLs: host without `www.`, path without a
/// trailing slash, query kept, fragment and scheme dropped.
///
/// Returns `None` for anything that is not an absolute http(s) URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    let path = parsed.path().trim_end_matches('/');
    let mut key = format!("{host}{path}");
    if let Some(query) = parsed.query() {
        key.push('?');
        key.push_str(query);
    }
    Some(key)
}

/// Page text retrieved for a selected search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedSource {
    pub url: String,
    pub title: String,
    pub content: String,
}

/// What the model returns when asked to summarize one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDigest {
    pub claims: Vec<String>,
    pub confidence: f64,
}

/// Condensed claims extracted from one fetched source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub url: String,
    pub title: String,
    pub claims: Vec<String>,
    pub confidence: f64,
}

/// What the model returns when composing the brief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisDraft {
    pub narrative: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    /// URLs of the offered sources the model chose for the reference list.
    /// Empty means every offered source.
    #[serde(default)]
    pub cited_sources: Vec<String>,
}

/// Maximum characters of an excerpt carried on a reference.
pub const MAX_EXCERPT_CHARS: usize = 200;

/// A numbered citation target in the brief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub index: usize,
    pub url: String,
    pub title: String,
    pub excerpt: String,
}

impl Reference {
    /// Build the reference for a surviving summary.
    pub fn from_summary(index: usize, summary: &SourceSummary) -> Self {
        let excerpt = summary
            .claims
            .first()
            .map(String::as_str)
            .unwrap_or(summary.title.as_str());
        Self {
            index,
            url: summary.url.clone(),
            title: summary.title.clone(),
            excerpt: truncate_chars(excerpt, MAX_EXCERPT_CHARS),
        }
    }
}

/// Wall-clock time spent in one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_ms: u64,
}

/// A source that was selected but did not make it into the brief.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedSource {
    pub url: String,
    pub stage: Stage,
    pub reason: String,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Provenance recorded on every brief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub stage_timings: Vec<StageTiming>,
    pub retry_count: u32,
    pub search_attempts: u32,
    #[serde(default)]
    pub dropped_sources: Vec<DroppedSource>,
    /// Mean confidence of the summaries backing the references.
    pub confidence: f64,
    /// Citation markers removed because no reference backed them.
    #[serde(default)]
    pub stripped_citations: usize,
    /// Model tokens spent on this brief.
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// Time spent in the stages, excluding time between a crash and a resume.
    #[serde(default)]
    pub processing_ms: u64,
}

/// The final research brief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalBrief {
    pub query: String,
    pub narrative: String,
    pub key_findings: Vec<String>,
    pub references: Vec<Reference>,
    pub metadata: GenerationMetadata,
}

/// A completed request/response pair kept in session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub request: BriefRequest,
    pub brief: FinalBrief,
    pub context_summary: ContextSummary,
    pub completed_at: DateTime<Utc>,
}

/// A session and its ordered history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            turn_count: self.turns.len(),
            last_query: self.turns.last().map(|t| t.request.query.clone()),
            updated_at: self.updated_at,
        }
    }
}

/// Listing entry for a stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub turn_count: usize,
    pub last_query: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregates over the briefs stored in one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_briefs: usize,
    pub avg_processing_ms: f64,
    pub total_tokens: usize,
    pub avg_confidence: f64,
    pub total_references: usize,
    pub total_retries: u32,
}

impl SessionStats {
    pub fn from_turns(turns: &[Turn]) -> Self {
        if turns.is_empty() {
            return Self::default();
        }
        let count = turns.len() as f64;
        let meta = || turns.iter().map(|t| &t.brief.metadata);
        Self {
            total_briefs: turns.len(),
            avg_processing_ms: meta().map(|m| m.processing_ms as f64).sum::<f64>() / count,
            total_tokens: meta().map(|m| m.token_usage.total()).sum(),
            avg_confidence: meta().map(|m| m.confidence).sum::<f64>() / count,
            total_references: turns.iter().map(|t| t.brief.references.len()).sum(),
            total_retries: meta().map(|m| m.retry_count).sum(),
        }
    }
}

/// The error half of a [`BriefResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: FailureKind,
    pub message: String,
}

/// Wire response: `{"brief": {...}}` or `{"error": {"kind", "message"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BriefResponse {
    Brief(Box<FinalBrief>),
    Error(ErrorBody),
}

impl From<Result<FinalBrief, RunFailure>> for BriefResponse {
    fn from(result: Result<FinalBrief, RunFailure>) -> Self {
        match result {
            Ok(brief) => BriefResponse::Brief(Box::new(brief)),
            Err(failure) => BriefResponse::Error(ErrorBody {
                kind: failure.kind,
                message: failure.message,
            }),
        }
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(url: &str, relevance: f64) -> SearchResult {
        SearchResult::new(url, "title", "snippet", relevance)
    }

    #[test]
    fn test_depth_levels() {
        assert_eq!(ResearchDepth::from_level(1), Some(ResearchDepth::Shallow));
        assert_eq!(ResearchDepth::from_level(3), Some(ResearchDepth::Deep));
        assert_eq!(ResearchDepth::from_level(4), None);
        assert_eq!(ResearchDepth::Deep.level(), 3);
        assert_eq!(BriefRequest::new("q").depth(), ResearchDepth::Medium);
    }

    #[test]
    fn test_request_wire_format_is_camel_case() {
        let raw = serde_json::json!({
            "query": "remote work",
            "sessionId": "s-1",
            "constraints": {"depth": 3, "maxSources": 4}
        });
        let request: BriefRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.session_id.as_deref(), Some("s-1"));
        assert_eq!(request.max_sources(), Some(4));
        assert_eq!(request.depth(), ResearchDepth::Deep);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("https://www.Example.com/a/"),
            Some("example.com/a".into())
        );
        assert_eq!(
            normalize_url("http://example.com/a#frag"),
            Some("example.com/a".into())
        );
        assert_eq!(normalize_url("ftp://example.com/a"), None);
        assert_eq!(normalize_url("not a url"), None);
    }

    #[test]
    fn test_result_set_dedupes_and_sorts() {
        let set = SearchResultSet::from_results(
            vec![
                hit("https://a.com/x", 0.4),
                hit("https://b.com/y", 0.9),
                hit("https://www.a.com/x/", 0.7),
                hit("ftp://c.com/z", 1.0),
            ],
            10,
        );
        let urls: Vec<&str> = set.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://b.com/y", "https://www.a.com/x/"]);
        assert!(set.contains_url("https://a.com/x"));
    }

    #[test]
    fn test_result_set_clamps_and_truncates() {
        let set =
            SearchResultSet::from_results(vec![hit("https://a.com", 3.0), hit("https://b.com", -1.0)], 1);
        assert_eq!(set.len(), 1);
        assert_eq!(set.results()[0].relevance, 1.0);
    }

    #[test]
    fn test_merge_keeps_best_duplicate() {
        let first = SearchResultSet::from_results(vec![hit("https://a.com/1", 0.2)], 5);
        let second = SearchResultSet::from_results(vec![hit("https://a.com/1", 0.8)], 5);
        let merged = SearchResultSet::merge([first, second], 5);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.results()[0].relevance, 0.8);
    }

    #[test]
    fn test_reference_excerpt_is_bounded() {
        let summary = SourceSummary {
            url: "https://a.com".into(),
            title: "A".into(),
            claims: vec!["x".repeat(500)],
            confidence: 0.5,
        };
        let reference = Reference::from_summary(1, &summary);
        assert_eq!(reference.excerpt.chars().count(), MAX_EXCERPT_CHARS);
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    fn turn(processing_ms: u64, tokens: usize, confidence: f64) -> Turn {
        Turn {
            request: BriefRequest::new("q"),
            brief: FinalBrief {
                query: "q".into(),
                narrative: "n [1]".into(),
                key_findings: vec![],
                references: vec![Reference {
                    index: 1,
                    url: "https://a.com".into(),
                    title: "A".into(),
                    excerpt: String::new(),
                }],
                metadata: GenerationMetadata {
                    run_id: Uuid::nil(),
                    session_id: Some("s".into()),
                    generated_at: Utc::now(),
                    stage_timings: vec![],
                    retry_count: 1,
                    search_attempts: 2,
                    dropped_sources: vec![],
                    confidence,
                    stripped_citations: 0,
                    token_usage: TokenUsage {
                        input_tokens: tokens,
                        output_tokens: 0,
                    },
                    processing_ms,
                },
            },
            context_summary: ContextSummary::empty(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_session_stats_aggregate_turns() {
        let stats = SessionStats::from_turns(&[turn(1_000, 300, 0.6), turn(3_000, 700, 0.8)]);
        assert_eq!(stats.total_briefs, 2);
        assert_eq!(stats.avg_processing_ms, 2_000.0);
        assert_eq!(stats.total_tokens, 1_000);
        assert!((stats.avg_confidence - 0.7).abs() < 1e-9);
        assert_eq!(stats.total_references, 2);
        assert_eq!(stats.total_retries, 2);
        assert_eq!(SessionStats::from_turns(&[]), SessionStats::default());
    }

    #[test]
    fn test_metadata_without_usage_still_parses() {
        let mut value = serde_json::to_value(turn(10, 5, 0.5).brief.metadata).unwrap();
        let map = value.as_object_mut().unwrap();
        map.remove("token_usage");
        map.remove("processing_ms");
        let meta: GenerationMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(meta.token_usage, TokenUsage::default());
        assert_eq!(meta.processing_ms, 0);
    }

    #[test]
    fn test_brief_response_shape() {
        let response = BriefResponse::from(Err::<FinalBrief, _>(RunFailure::new(
            FailureKind::NoResults,
            "insufficient evidence",
        )));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["kind"], "NoResults");
        assert_eq!(json["error"]["message"], "insufficient evidence");
    }
}
