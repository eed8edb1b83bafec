//! Data contracts between workflow stages.
//!
//! Every record that crosses a stage boundary implements [`Contract`]. Raw
//! JSON enters through [`validate`], which checks the shape with serde and then
//! the declared invariants; typed values produced in-process are re-checked
//! with [`validate_value`]. Referential checks that span two records live in
//! [`check_source_refs`] and [`check_citations`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{
    BriefRequest, ContextSummary, FinalBrief, MAX_EXCERPT_CHARS, ResearchPlan, RevisedQuery,
    SearchResult, SearchResultSet, SourceDigest, SourceSummary, SynthesisDraft, Turn,
    normalize_url,
};
use crate::workflow::postprocess::cited_indices;

/// Maximum characters accepted in a request query.
pub const MAX_QUERY_CHARS: usize = 500;
/// Maximum characters accepted in a session id.
pub const MAX_SESSION_ID_CHARS: usize = 100;
/// Maximum sub-queries a plan may carry.
pub const MAX_PLAN_SUB_QUERIES: usize = 10;
/// Maximum claims a source summary may carry.
pub const MAX_SOURCE_CLAIMS: usize = 10;
/// Upper bound on `constraints.maxSources`.
pub const MAX_SOURCES_LIMIT: usize = 20;

/// Tag naming the contract a violation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    BriefRequest,
    ContextSummary,
    ResearchPlan,
    RevisedQuery,
    SearchResult,
    SourceDigest,
    SourceSummary,
    SynthesisDraft,
    FinalBrief,
    Turn,
}

impl std::fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchemaKind::BriefRequest => "brief_request",
            SchemaKind::ContextSummary => "context_summary",
            SchemaKind::ResearchPlan => "research_plan",
            SchemaKind::RevisedQuery => "revised_query",
            SchemaKind::SearchResult => "search_result",
            SchemaKind::SourceDigest => "source_digest",
            SchemaKind::SourceSummary => "source_summary",
            SchemaKind::SynthesisDraft => "synthesis_draft",
            SchemaKind::FinalBrief => "final_brief",
            SchemaKind::Turn => "turn",
        };
        write!(f, "{name}")
    }
}

/// A record with declared invariants.
pub trait Contract: Serialize + DeserializeOwned + Send + 'static {
    const SCHEMA: SchemaKind;

    /// Record every invariant violation on the checker.
    fn check(&self, checker: &mut Checker);

    /// JSON shape shown to the model when this contract is requested.
    fn shape() -> &'static str;
}

/// Validate raw JSON against contract `T`.
pub fn validate<T: Contract>(raw: Value) -> Result<T, ValidationError> {
    let value: T = serde_json::from_value(raw).map_err(|e| ValidationError {
        schema: T::SCHEMA,
        path: serde_error_path(&e.to_string()),
        rule: e.to_string(),
    })?;
    validate_value(&value)?;
    Ok(value)
}

/// Re-check the invariants of an already typed value.
pub fn validate_value<T: Contract>(value: &T) -> Result<(), ValidationError> {
    let mut checker = Checker::new(T::SCHEMA);
    value.check(&mut checker);
    checker.finish()
}

/// Every summary URL must come from the run's search results.
pub fn check_source_refs(
    summaries: &[SourceSummary],
    results: &SearchResultSet,
) -> Result<(), ValidationError> {
    for (i, summary) in summaries.iter().enumerate() {
        if !results.contains_url(&summary.url) {
            return Err(ValidationError {
                schema: SchemaKind::SourceSummary,
                path: format!("source_summaries[{i}].url"),
                rule: format!("{} is not among the run's search results", summary.url),
            });
        }
    }
    Ok(())
}

/// Every `[n]` marker in the brief must resolve to a reference.
pub fn check_citations(brief: &FinalBrief) -> Result<(), ValidationError> {
    let mut checker = Checker::new(SchemaKind::FinalBrief);
    citations_resolve(brief, &mut checker);
    checker.finish()
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Collects the first invariant violation of a record.
pub struct Checker {
    schema: SchemaKind,
    prefix: Vec<String>,
    violation: Option<ValidationError>,
}

impl Checker {
    pub fn new(schema: SchemaKind) -> Self {
        Self {
            schema,
            prefix: Vec::new(),
            violation: None,
        }
    }

    /// Run `f` with `segment` prepended to every path it reports.
    pub fn nested(&mut self, segment: impl Into<String>, f: impl FnOnce(&mut Checker)) {
        self.prefix.push(segment.into());
        f(self);
        self.prefix.pop();
    }

    pub fn fail(&mut self, field: &str, rule: impl Into<String>) {
        if self.violation.is_none() {
            self.violation = Some(ValidationError {
                schema: self.schema,
                path: self.path_for(field),
                rule: rule.into(),
            });
        }
    }

    pub fn non_empty(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.fail(field, "must not be empty");
        }
    }

    pub fn max_chars(&mut self, field: &str, value: &str, max: usize) {
        let count = value.chars().count();
        if count > max {
            self.fail(field, format!("must be at most {max} characters, got {count}"));
        }
    }

    pub fn unit_interval(&mut self, field: &str, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            self.fail(field, format!("must be within [0, 1], got {value}"));
        }
    }

    pub fn in_range(&mut self, field: &str, value: usize, min: usize, max: usize) {
        if value < min || value > max {
            self.fail(field, format!("must be within {min}..={max}, got {value}"));
        }
    }

    pub fn item_count(&mut self, field: &str, len: usize, min: usize, max: usize) {
        if len < min {
            self.fail(field, format!("must contain at least {min} item(s)"));
        } else if len > max {
            self.fail(field, format!("must contain at most {max} items, got {len}"));
        }
    }

    pub fn each_non_empty(&mut self, field: &str, values: &[String]) {
        for (i, value) in values.iter().enumerate() {
            self.non_empty(&format!("{field}[{i}]"), value);
        }
    }

    pub fn http_url(&mut self, field: &str, value: &str) {
        if normalize_url(value).is_none() {
            self.fail(field, format!("must be an absolute http(s) URL, got {value:?}"));
        }
    }

    pub fn finish(self) -> Result<(), ValidationError> {
        match self.violation {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    fn path_for(&self, field: &str) -> String {
        if self.prefix.is_empty() {
            field.to_string()
        } else if field.is_empty() {
            self.prefix.join(".")
        } else {
            format!("{}.{}", self.prefix.join("."), field)
        }
    }
}

/// Pull the field name out of a serde error message when it names one.
fn serde_error_path(message: &str) -> String {
    for marker in ["missing field `", "unknown field `", "duplicate field `"] {
        if let Some(rest) = message.split(marker).nth(1)
            && let Some(field) = rest.split('`').next()
        {
            return field.to_string();
        }
    }
    "$".to_string()
}

fn citations_resolve(brief: &FinalBrief, checker: &mut Checker) {
    let known = |n: usize| brief.references.iter().any(|r| r.index == n);
    for n in cited_indices(&brief.narrative) {
        if !known(n) {
            checker.fail("narrative", format!("citation [{n}] has no matching reference"));
        }
    }
    for (i, finding) in brief.key_findings.iter().enumerate() {
        for n in cited_indices(finding) {
            if !known(n) {
                checker.fail(
                    &format!("key_findings[{i}]"),
                    format!("citation [{n}] has no matching reference"),
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Contract implementations
// ---------------------------------------------------------------------------

impl Contract for BriefRequest {
    const SCHEMA: SchemaKind = SchemaKind::BriefRequest;

    fn check(&self, c: &mut Checker) {
        c.non_empty("query", &self.query);
        c.max_chars("query", self.query.trim(), MAX_QUERY_CHARS);
        if let Some(session_id) = &self.session_id {
            c.non_empty("sessionId", session_id);
            c.max_chars("sessionId", session_id, MAX_SESSION_ID_CHARS);
        }
        if let Some(constraints) = &self.constraints {
            if let Some(depth) = constraints.depth {
                c.in_range("constraints.depth", depth as usize, 1, 3);
            }
            if let Some(max_sources) = constraints.max_sources {
                c.in_range("constraints.maxSources", max_sources, 1, MAX_SOURCES_LIMIT);
            }
        }
    }

    fn shape() -> &'static str {
        r#"{"query": string, "sessionId"?: string, "constraints"?: {"depth"?: 1-3, "maxSources"?: 1-20}}"#
    }
}

impl Contract for ContextSummary {
    const SCHEMA: SchemaKind = SchemaKind::ContextSummary;

    fn check(&self, c: &mut Checker) {
        if self.turn_count > 0 || !self.previous_queries.is_empty() {
            c.non_empty("text", &self.text);
        }
        c.each_non_empty("key_insights", &self.key_insights);
    }

    fn shape() -> &'static str {
        r#"{"text": string, "key_insights": [string]}"#
    }
}

impl Contract for ResearchPlan {
    const SCHEMA: SchemaKind = SchemaKind::ResearchPlan;

    fn check(&self, c: &mut Checker) {
        c.item_count("sub_queries", self.sub_queries.len(), 1, MAX_PLAN_SUB_QUERIES);
        c.each_non_empty("sub_queries", &self.sub_queries);
        for (i, query) in self.sub_queries.iter().enumerate() {
            c.max_chars(&format!("sub_queries[{i}]"), query, MAX_QUERY_CHARS);
        }
    }

    fn shape() -> &'static str {
        r#"{"sub_queries": [string, 1-10 items], "rationale": string, "focus_areas": [string]}"#
    }
}

impl Contract for RevisedQuery {
    const SCHEMA: SchemaKind = SchemaKind::RevisedQuery;

    fn check(&self, c: &mut Checker) {
        c.non_empty("query", &self.query);
        c.max_chars("query", &self.query, MAX_QUERY_CHARS);
    }

    fn shape() -> &'static str {
        r#"{"query": string}"#
    }
}

impl Contract for SearchResult {
    const SCHEMA: SchemaKind = SchemaKind::SearchResult;

    fn check(&self, c: &mut Checker) {
        c.http_url("url", &self.url);
        c.unit_interval("relevance", self.relevance);
    }

    fn shape() -> &'static str {
        r#"{"url": string, "title": string, "snippet": string, "relevance": 0.0-1.0}"#
    }
}

impl Contract for SourceDigest {
    const SCHEMA: SchemaKind = SchemaKind::SourceDigest;

    fn check(&self, c: &mut Checker) {
        c.item_count("claims", self.claims.len(), 1, MAX_SOURCE_CLAIMS);
        c.each_non_empty("claims", &self.claims);
        c.unit_interval("confidence", self.confidence);
    }

    fn shape() -> &'static str {
        r#"{"claims": [string, 1-10 items], "confidence": 0.0-1.0}"#
    }
}

impl Contract for SourceSummary {
    const SCHEMA: SchemaKind = SchemaKind::SourceSummary;

    fn check(&self, c: &mut Checker) {
        c.http_url("url", &self.url);
        c.item_count("claims", self.claims.len(), 1, MAX_SOURCE_CLAIMS);
        c.each_non_empty("claims", &self.claims);
        c.unit_interval("confidence", self.confidence);
    }

    fn shape() -> &'static str {
        r#"{"url": string, "title": string, "claims": [string, 1-10 items], "confidence": 0.0-1.0}"#
    }
}

impl Contract for SynthesisDraft {
    const SCHEMA: SchemaKind = SchemaKind::SynthesisDraft;

    fn check(&self, c: &mut Checker) {
        c.non_empty("narrative", &self.narrative);
        c.item_count("key_findings", self.key_findings.len(), 1, usize::MAX);
        c.each_non_empty("key_findings", &self.key_findings);
        c.each_non_empty("cited_sources", &self.cited_sources);
    }

    fn shape() -> &'static str {
        r#"{"narrative": string with [n] citation markers, "key_findings": [string], "cited_sources": [source url]}"#
    }
}

impl Contract for FinalBrief {
    const SCHEMA: SchemaKind = SchemaKind::FinalBrief;

    fn check(&self, c: &mut Checker) {
        c.non_empty("query", &self.query);
        c.non_empty("narrative", &self.narrative);
        c.each_non_empty("key_findings", &self.key_findings);
        for (i, reference) in self.references.iter().enumerate() {
            c.nested(format!("references[{i}]"), |c| {
                if reference.index == 0 {
                    c.fail("index", "must be 1-based");
                }
                c.http_url("url", &reference.url);
                c.max_chars("excerpt", &reference.excerpt, MAX_EXCERPT_CHARS);
            });
        }
        for (i, reference) in self.references.iter().enumerate() {
            if self.references[..i].iter().any(|r| r.index == reference.index) {
                c.fail(&format!("references[{i}].index"), "must be unique");
            }
        }
        c.unit_interval("metadata.confidence", self.metadata.confidence);
        citations_resolve(self, c);
    }

    fn shape() -> &'static str {
        r#"{"query": string, "narrative": string, "key_findings": [string], "references": [{"index": n, "url": string, "title": string, "excerpt": string}], "metadata": {...}}"#
    }
}

impl Contract for Turn {
    const SCHEMA: SchemaKind = SchemaKind::Turn;

    fn check(&self, c: &mut Checker) {
        c.nested("request", |c| self.request.check(c));
        c.nested("brief", |c| self.brief.check(c));
        c.nested("context_summary", |c| self.context_summary.check(c));
    }

    fn shape() -> &'static str {
        r#"{"request": {...}, "brief": {...}, "context_summary": {...}, "completed_at": string}"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GenerationMetadata, Reference};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use uuid::Uuid;

    fn brief(narrative: &str, indices: &[usize]) -> FinalBrief {
        FinalBrief {
            query: "q".into(),
            narrative: narrative.into(),
            key_findings: vec!["finding".into()],
            references: indices
                .iter()
                .map(|&i| Reference {
                    index: i,
                    url: format!("https://example.com/{i}"),
                    title: format!("Source {i}"),
                    excerpt: "excerpt".into(),
                })
                .collect(),
            metadata: GenerationMetadata {
                run_id: Uuid::new_v4(),
                session_id: None,
                generated_at: Utc::now(),
                stage_timings: vec![],
                retry_count: 0,
                search_attempts: 1,
                dropped_sources: vec![],
                confidence: 0.8,
                stripped_citations: 0,
                token_usage: Default::default(),
                processing_ms: 0,
            },
        }
    }

    #[test]
    fn test_request_accepts_valid_input() {
        let request: BriefRequest = validate(json!({
            "query": "  effects of remote work  ",
            "constraints": {"depth": 2}
        }))
        .unwrap();
        assert_eq!(request.normalized().query, "effects of remote work");
    }

    #[test]
    fn test_request_rejects_blank_query() {
        let err = validate::<BriefRequest>(json!({"query": "   "})).unwrap_err();
        assert_eq!(err.schema, SchemaKind::BriefRequest);
        assert_eq!(err.path, "query");
        assert_eq!(err.rule, "must not be empty");
    }

    #[test]
    fn test_request_rejects_long_query() {
        let err = validate::<BriefRequest>(json!({"query": "x".repeat(501)})).unwrap_err();
        assert_eq!(err.path, "query");
        assert!(err.rule.contains("at most 500"));
    }

    #[test]
    fn test_request_rejects_out_of_range_constraints() {
        let err = validate::<BriefRequest>(json!({
            "query": "valid query",
            "constraints": {"depth": 7}
        }))
        .unwrap_err();
        assert_eq!(err.path, "constraints.depth");

        let err = validate::<BriefRequest>(json!({
            "query": "valid query",
            "constraints": {"maxSources": 0}
        }))
        .unwrap_err();
        assert_eq!(err.path, "constraints.maxSources");
    }

    #[test]
    fn test_missing_field_reports_path() {
        let err = validate::<ResearchPlan>(json!({"rationale": "x"})).unwrap_err();
        assert_eq!(err.schema, SchemaKind::ResearchPlan);
        assert_eq!(err.path, "sub_queries");
    }

    #[test]
    fn test_plan_requires_non_empty_sub_queries() {
        let err = validate::<ResearchPlan>(json!({"sub_queries": []})).unwrap_err();
        assert_eq!(err.path, "sub_queries");

        let err = validate::<ResearchPlan>(json!({"sub_queries": ["ok", " "]})).unwrap_err();
        assert_eq!(err.path, "sub_queries[1]");
    }

    #[test]
    fn test_digest_confidence_bounds() {
        let err = validate::<SourceDigest>(json!({"claims": ["a"], "confidence": 1.5})).unwrap_err();
        assert_eq!(err.path, "confidence");
        assert!(validate::<SourceDigest>(json!({"claims": ["a"], "confidence": 0.5})).is_ok());
    }

    #[test]
    fn test_source_refs_must_trace_to_results() {
        let results = SearchResultSet::from_results(
            vec![SearchResult::new("https://a.com/1", "A", "", 0.9)],
            5,
        );
        let ok = SourceSummary {
            url: "https://a.com/1".into(),
            title: "A".into(),
            claims: vec!["claim".into()],
            confidence: 0.7,
        };
        let stray = SourceSummary {
            url: "https://elsewhere.com".into(),
            ..ok.clone()
        };
        assert!(check_source_refs(std::slice::from_ref(&ok), &results).is_ok());
        let err = check_source_refs(&[ok, stray], &results).unwrap_err();
        assert_eq!(err.path, "source_summaries[1].url");
    }

    #[test]
    fn test_citations_must_resolve() {
        assert!(check_citations(&brief("Claim [1] and [2].", &[1, 2])).is_ok());
        let err = check_citations(&brief("Claim [3].", &[1, 2])).unwrap_err();
        assert_eq!(err.path, "narrative");
        assert!(err.rule.contains("[3]"));
    }

    #[test]
    fn test_brief_rejects_duplicate_reference_indices() {
        let err = validate_value(&brief("Claim [1].", &[1, 1])).unwrap_err();
        assert_eq!(err.path, "references[1].index");
    }

    #[test]
    fn test_nested_paths() {
        let mut checker = Checker::new(SchemaKind::Turn);
        checker.nested("brief", |c| c.nested("references[0]", |c| c.fail("url", "bad")));
        let err = checker.finish().unwrap_err();
        assert_eq!(err.path, "brief.references[0].url");
    }
}
