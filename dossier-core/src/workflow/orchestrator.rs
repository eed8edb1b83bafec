//! The research workflow driver.
//!
//! [`Orchestrator`] walks a [`RunState`] through the stage graph. Each step
//! reads the state, talks to the collaborators and returns an [`Advance`];
//! the state is only mutated after the step completes, then checkpointed.
//! A cancelled step therefore leaves the last checkpoint untouched.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::checkpoint::{CheckpointStore, FileCheckpointStore};
use super::postprocess::{cited_indices, enforce_citations};
use super::prompts;
use super::state::{Advance, RunState, Stage};
use crate::config::DossierConfig;
use crate::context::{ContextStore, FileContextStore};
use crate::error::{DossierError, FailureKind, RunFailure, WorkflowError};
use crate::fetch::{ContentFetcher, HttpContentFetcher};
use crate::llm::{LlmGateway, Reply};
use crate::schema::{check_citations, check_source_refs, validate, validate_value};
use crate::search::SearchGateway;
use crate::trace::{StageOutcome, TraceEvent, TraceSink, TracingSink};
use crate::types::{
    BriefRequest, BriefResponse, ContextSummary, DroppedSource, FetchedSource, FinalBrief,
    GenerationMetadata, Reference, ResearchPlan, RevisedQuery, SearchResult, SourceDigest,
    SourceSummary, SynthesisDraft, TokenUsage, Turn, normalize_url, truncate_chars,
};

/// Everything the workflow talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub llm: Arc<LlmGateway>,
    pub search: Arc<SearchGateway>,
    pub fetcher: Arc<dyn ContentFetcher>,
    pub context: Arc<dyn ContextStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub trace: Arc<dyn TraceSink>,
}

/// Tunables the stages read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub search_retry_ceiling: u32,
    pub fan_out: usize,
    pub max_sub_queries: usize,
    pub default_max_sources: usize,
    pub max_references: usize,
    pub results_per_query: usize,
    pub history_window: usize,
    /// Turns older than this many days are not summarized (0 = no limit).
    pub history_max_age_days: u32,
    pub summary_max_chars: usize,
    pub min_content_chars: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from_config(&DossierConfig::default())
    }
}

impl WorkflowSettings {
    pub fn from_config(config: &DossierConfig) -> Self {
        Self {
            search_retry_ceiling: config.workflow.search_retry_ceiling,
            fan_out: config.workflow.fan_out.max(1),
            max_sub_queries: config.workflow.max_sub_queries.max(1),
            default_max_sources: config.workflow.default_max_sources.max(1),
            max_references: config.workflow.max_references,
            results_per_query: config.search.results_per_query.max(1),
            history_window: config.context.history_window,
            history_max_age_days: config.context.max_age_days,
            summary_max_chars: config.context.summary_max_chars.max(1),
            min_content_chars: config.fetch.min_content_chars,
        }
    }
}

pub struct Orchestrator {
    collab: Collaborators,
    settings: WorkflowSettings,
}

/// Tokens spent by the stage in flight. Shared by the fan-out futures.
#[derive(Default)]
struct StageUsage(Mutex<TokenUsage>);

impl StageUsage {
    fn record<T>(&self, reply: Reply<T>) -> T {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .accumulate(&reply.usage);
        reply.value
    }

    fn total(&self) -> TokenUsage {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Orchestrator {
    pub fn new(collab: Collaborators, settings: WorkflowSettings) -> Self {
        Self { collab, settings }
    }

    /// Wire up the HTTP providers and file stores described by `config`.
    pub fn from_config(config: &DossierConfig) -> Result<Self, DossierError> {
        let trace: Arc<dyn TraceSink> = Arc::new(TracingSink);
        let llm = LlmGateway::from_config(&config.llm, trace.clone())?;
        let search = SearchGateway::from_config(&config.search, trace.clone());
        let fetcher = HttpContentFetcher::new(&config.fetch)?;
        let collab = Collaborators {
            llm: Arc::new(llm),
            search: Arc::new(search),
            fetcher: Arc::new(fetcher),
            context: Arc::new(FileContextStore::new(
                config.session_dir(),
                config.context.max_turns,
            )),
            checkpoints: Arc::new(FileCheckpointStore::new(config.checkpoint_dir())),
            trace,
        };
        Ok(Self::new(collab, WorkflowSettings::from_config(config)))
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn context_store(&self) -> &Arc<dyn ContextStore> {
        &self.collab.context
    }

    pub async fn run(&self, request: BriefRequest) -> Result<FinalBrief, RunFailure> {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        request: BriefRequest,
        cancel: CancellationToken,
    ) -> Result<FinalBrief, RunFailure> {
        let state = self.execute(request, cancel).await;
        finish(&state)
    }

    /// Run a request to completion and return the final state.
    pub async fn execute(&self, request: BriefRequest, cancel: CancellationToken) -> RunState {
        let state = RunState::new(request.normalized());
        info!(
            run_id = %state.run_id,
            query = %state.request.query,
            session_id = state.session_id().unwrap_or("-"),
            "Starting research run"
        );
        self.drive(state, cancel).await
    }

    /// Validate a raw ingress payload and answer with the wire response.
    pub async fn respond(&self, raw: Value) -> BriefResponse {
        match validate::<BriefRequest>(raw) {
            Ok(request) => self.run(request).await.into(),
            Err(violation) => {
                warn!(error = %violation, "Rejected brief request");
                BriefResponse::from(Err::<FinalBrief, _>(RunFailure::from(violation)))
            }
        }
    }

    /// Continue a checkpointed run from its last completed stage.
    pub async fn resume(
        &self,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<FinalBrief, RunFailure> {
        let state = self
            .collab
            .checkpoints
            .load(run_id)
            .await
            .map_err(WorkflowError::from)?
            .ok_or(WorkflowError::RunNotFound { run_id })?;
        info!(run_id = %run_id, stage = %state.stage, "Resuming run");
        self.resume_state(state, cancel).await
    }

    pub async fn resume_state(
        &self,
        state: RunState,
        cancel: CancellationToken,
    ) -> Result<FinalBrief, RunFailure> {
        let state = self.drive(state, cancel).await;
        finish(&state)
    }

    async fn drive(&self, mut state: RunState, cancel: CancellationToken) -> RunState {
        while !state.stage.is_terminal() {
            let stage = state.stage;
            let started = Instant::now();
            let usage = StageUsage::default();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.step(&state, &usage) => Some(result),
            };
            let elapsed = started.elapsed();
            state.token_usage.accumulate(&usage.total());

            let outcome = match step {
                None => {
                    info!(run_id = %state.run_id, stage = %stage, "Run cancelled");
                    state.fail(RunFailure::new(
                        FailureKind::Cancelled,
                        format!("cancelled during {stage}"),
                    ));
                    self.emit_stage(&state, stage, elapsed, StageOutcome::Cancelled);
                    return state;
                }
                Some(Ok(advance)) => {
                    state.apply(advance, elapsed);
                    if state.stage.is_terminal() && state.stage != Stage::Done {
                        StageOutcome::Failed
                    } else {
                        StageOutcome::Completed
                    }
                }
                Some(Err(failure)) => {
                    warn!(
                        run_id = %state.run_id,
                        stage = %stage,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Stage failed"
                    );
                    state.fail(failure);
                    StageOutcome::Failed
                }
            };
            debug!(run_id = %state.run_id, from = %stage, to = %state.stage, "Stage transition");
            self.emit_stage(&state, stage, elapsed, outcome);

            if let Err(e) = self.collab.checkpoints.save(&state).await {
                error!(run_id = %state.run_id, error = %e, "Failed to write checkpoint");
                state.fail(RunFailure::from(e));
                return state;
            }
        }
        state
    }

    fn emit_stage(&self, state: &RunState, stage: Stage, elapsed: Duration, outcome: StageOutcome) {
        self.collab.trace.emit(TraceEvent::Stage {
            run_id: state.run_id,
            stage,
            duration_ms: elapsed.as_millis() as u64,
            outcome,
            retry_count: state.retry_count,
        });
    }

    async fn step(&self, state: &RunState, usage: &StageUsage) -> Result<Advance, RunFailure> {
        match state.stage {
            Stage::Init => self.init(state).await,
            Stage::ContextSummarize => self.summarize_context(state, usage).await,
            Stage::Plan => self.plan(state, usage).await,
            Stage::Search => self.search(state).await,
            Stage::RetrySearch => self.revise_search(state, usage).await,
            Stage::Fetch => self.fetch(state).await,
            Stage::SourceSummarize => self.summarize_sources(state, usage).await,
            Stage::Synthesize => self.synthesize(state, usage).await,
            Stage::PostProcess => self.post_process(state).await,
            Stage::Done | Stage::Failed(_) => Err(RunFailure::internal(format!(
                "stage {} has no successor",
                state.stage
            ))),
        }
    }

    async fn init(&self, state: &RunState) -> Result<Advance, RunFailure> {
        validate_value(&state.request)?;
        let mut history = match state.session_id() {
            Some(session_id) => self.collab.context.get_history(session_id).await?,
            None => Vec::new(),
        };
        let max_age = chrono::Duration::days(i64::from(self.settings.history_max_age_days));
        if self.settings.history_max_age_days > 0
            && let Some(cutoff) = Utc::now().checked_sub_signed(max_age)
        {
            let before = history.len();
            history.retain(|turn| turn.completed_at >= cutoff);
            if history.len() < before {
                debug!(
                    run_id = %state.run_id,
                    skipped = before - history.len(),
                    "Leaving aged turns out of the context summary"
                );
            }
        }
        if history.len() > self.settings.history_window {
            history = history.split_off(history.len() - self.settings.history_window);
        }
        Ok(Advance::Initialized { history })
    }

    async fn summarize_context(
        &self,
        state: &RunState,
        usage: &StageUsage,
    ) -> Result<Advance, RunFailure> {
        if let Some(summary) = &state.context_summary {
            return Ok(Advance::ContextReady(summary.clone()));
        }
        if state.history.is_empty() {
            return Ok(Advance::ContextReady(ContextSummary::empty()));
        }

        let prompt =
            prompts::context_summary(&state.request, &state.history, self.settings.summary_max_chars);
        let mut summary = usage.record(self.collab.llm.invoke::<ContextSummary>(&prompt, None).await?);

        summary.previous_queries = state
            .history
            .iter()
            .map(|t| t.request.query.clone())
            .collect();
        summary.turn_count = state.history.len();
        if summary.text.trim().is_empty() {
            summary.text = format!("Previously researched: {}", summary.previous_queries.join("; "));
        }
        summary.text = truncate_chars(summary.text.trim(), self.settings.summary_max_chars);
        validate_value(&summary)?;
        Ok(Advance::ContextReady(summary))
    }

    async fn plan(&self, state: &RunState, usage: &StageUsage) -> Result<Advance, RunFailure> {
        if let Some(plan) = &state.plan {
            return Ok(Advance::Planned {
                plan: plan.clone(),
                queries: state.active_queries.clone(),
            });
        }
        let context = state.context_summary.clone().unwrap_or_default();
        let prompt = prompts::plan(
            &state.request,
            &context,
            state.request.depth(),
            self.settings.max_sub_queries,
        );
        let plan = usage.record(self.collab.llm.invoke::<ResearchPlan>(&prompt, None).await?);

        let mut queries: Vec<String> = Vec::new();
        for query in &plan.sub_queries {
            let query = query.trim().to_string();
            if !queries.contains(&query) {
                queries.push(query);
            }
        }
        queries.truncate(self.settings.max_sub_queries);
        info!(run_id = %state.run_id, sub_queries = queries.len(), "Research plan ready");
        Ok(Advance::Planned { plan, queries })
    }

    async fn search(&self, state: &RunState) -> Result<Advance, RunFailure> {
        if let Some(results) = &state.search_results {
            return Ok(Advance::Searched {
                results: results.clone(),
                fresh: false,
            });
        }
        let queries = if state.active_queries.is_empty() {
            vec![state.request.query.clone()]
        } else {
            state.active_queries.clone()
        };
        let budget = state
            .request
            .max_sources()
            .unwrap_or(self.settings.default_max_sources);

        let per_query = self.settings.results_per_query;
        let sets = futures::future::join_all(
            queries
                .iter()
                .map(|q| self.collab.search.search(q, per_query)),
        )
        .await;
        let results = SearchGateway::merge(sets, budget);
        info!(
            run_id = %state.run_id,
            attempt = state.search_attempts + 1,
            results = results.len(),
            "Search finished"
        );
        Ok(Advance::Searched {
            results,
            fresh: true,
        })
    }

    async fn revise_search(
        &self,
        state: &RunState,
        usage: &StageUsage,
    ) -> Result<Advance, RunFailure> {
        if state.retry_count >= self.settings.search_retry_ceiling {
            return Err(RunFailure::new(
                FailureKind::NoResults,
                format!(
                    "insufficient evidence: no search results after {} attempts",
                    state.search_attempts
                ),
            ));
        }
        let failed = state
            .active_queries
            .first()
            .map(String::as_str)
            .unwrap_or(state.request.query.as_str());
        let prompt = prompts::revise_query(&state.request, failed, state.retry_count + 1);
        let revised = usage.record(self.collab.llm.invoke::<RevisedQuery>(&prompt, None).await?);
        info!(
            run_id = %state.run_id,
            retry = state.retry_count + 1,
            query = %revised.query,
            "Retrying search with revised query"
        );
        Ok(Advance::Revised {
            query: revised.query.trim().to_string(),
        })
    }

    async fn fetch(&self, state: &RunState) -> Result<Advance, RunFailure> {
        if let Some(sources) = &state.fetched {
            return Ok(Advance::Fetched {
                sources: sources.clone(),
                dropped: Vec::new(),
            });
        }
        let results = state
            .search_results
            .as_ref()
            .ok_or_else(|| RunFailure::internal("fetch reached without search results"))?;

        let mut outcomes: Vec<(usize, Result<FetchedSource, DroppedSource>)> =
            stream::iter(results.iter().cloned().enumerate())
                .map(|(i, result)| async move { (i, self.fetch_one(result).await) })
                .buffer_unordered(self.settings.fan_out)
                .collect()
                .await;
        outcomes.sort_by_key(|(i, _)| *i);

        let (sources, dropped) = split_outcomes(outcomes);
        for d in &dropped {
            warn!(run_id = %state.run_id, url = %d.url, reason = %d.reason, "Dropped source");
        }
        if sources.is_empty() {
            return Err(RunFailure::new(
                FailureKind::NoUsableSources,
                format!("none of the {} selected sources could be fetched", results.len()),
            ));
        }
        Ok(Advance::Fetched { sources, dropped })
    }

    async fn fetch_one(&self, result: SearchResult) -> Result<FetchedSource, DroppedSource> {
        let dropped = |reason: String| DroppedSource {
            url: result.url.clone(),
            stage: Stage::Fetch,
            reason,
        };
        let min = self.settings.min_content_chars;
        let content = match self.collab.fetcher.fetch(&result.url).await {
            Ok(content) => content,
            Err(e) => return Err(dropped(e.to_string())),
        };
        let content = if content.chars().count() >= min {
            content
        } else if result.snippet.chars().count() >= min {
            debug!(url = %result.url, "Page text too short, using search snippet");
            result.snippet.clone()
        } else {
            return Err(dropped(format!("content shorter than {min} characters")));
        };
        Ok(FetchedSource {
            url: result.url.clone(),
            title: result.title.clone(),
            content,
        })
    }

    async fn summarize_sources(
        &self,
        state: &RunState,
        usage: &StageUsage,
    ) -> Result<Advance, RunFailure> {
        if let Some(summaries) = &state.source_summaries {
            return Ok(Advance::Summarized {
                summaries: summaries.clone(),
                dropped: Vec::new(),
            });
        }
        let (Some(fetched), Some(results)) = (&state.fetched, &state.search_results) else {
            return Err(RunFailure::internal(
                "source summarization reached without fetched sources",
            ));
        };

        let topic = state.request.query.as_str();
        let mut outcomes: Vec<(usize, Result<SourceSummary, DroppedSource>)> =
            stream::iter(fetched.iter().enumerate())
                .map(|(i, source)| async move {
                    (i, self.summarize_one(topic, source, usage).await)
                })
                .buffer_unordered(self.settings.fan_out)
                .collect()
                .await;
        outcomes.sort_by_key(|(i, _)| *i);

        let (summaries, dropped) = split_outcomes(outcomes);
        for d in &dropped {
            warn!(run_id = %state.run_id, url = %d.url, reason = %d.reason, "Source summary failed");
        }
        if summaries.is_empty() {
            return Err(RunFailure::new(
                FailureKind::NoUsableSources,
                "no source could be summarized",
            ));
        }
        check_source_refs(&summaries, results)?;
        Ok(Advance::Summarized { summaries, dropped })
    }

    async fn summarize_one(
        &self,
        topic: &str,
        source: &FetchedSource,
        usage: &StageUsage,
    ) -> Result<SourceSummary, DroppedSource> {
        let prompt = prompts::source_summary(topic, source);
        let summary = self
            .collab
            .llm
            .invoke::<SourceDigest>(&prompt, None)
            .await
            .map_err(|e| e.to_string())
            .map(|reply| usage.record(reply))
            .map(|digest| SourceSummary {
                url: source.url.clone(),
                title: source.title.clone(),
                claims: digest.claims,
                confidence: digest.confidence,
            })
            .and_then(|summary| {
                validate_value(&summary)
                    .map(|_| summary)
                    .map_err(|e| e.to_string())
            });
        summary.map_err(|reason| DroppedSource {
            url: source.url.clone(),
            stage: Stage::SourceSummarize,
            reason,
        })
    }

    async fn synthesize(&self, state: &RunState, usage: &StageUsage) -> Result<Advance, RunFailure> {
        if let Some(brief) = &state.brief {
            return Ok(Advance::Synthesized(brief.clone()));
        }
        let summaries = state
            .source_summaries
            .as_deref()
            .ok_or_else(|| RunFailure::internal("synthesis reached without source summaries"))?;
        let offered: Vec<SourceSummary> = summaries
            .iter()
            .take(self.settings.max_references)
            .cloned()
            .collect();

        let context = state.context_summary.clone().unwrap_or_default();
        let prompt = prompts::synthesis(&state.request, state.plan.as_ref(), &offered, &context);
        let draft = usage.record(self.collab.llm.invoke::<SynthesisDraft>(&prompt, None).await?);

        let (kept, unselected) = select_references(&draft, &offered);
        for d in &unselected {
            debug!(run_id = %state.run_id, url = %d.url, "Source left out of the reference list");
        }
        let references: Vec<Reference> = kept
            .iter()
            .map(|&i| Reference::from_summary(i + 1, &offered[i]))
            .collect();
        let confidence = if kept.is_empty() {
            0.0
        } else {
            kept.iter().map(|&i| offered[i].confidence).sum::<f64>() / kept.len() as f64
        };
        let mut dropped_sources = state.dropped_sources.clone();
        dropped_sources.extend(unselected);

        Ok(Advance::Synthesized(FinalBrief {
            query: state.request.query.clone(),
            narrative: draft.narrative.trim().to_string(),
            key_findings: draft.key_findings,
            references,
            metadata: GenerationMetadata {
                run_id: state.run_id,
                session_id: state.session_id().map(str::to_string),
                generated_at: Utc::now(),
                stage_timings: state.stage_timings.clone(),
                retry_count: state.retry_count,
                search_attempts: state.search_attempts,
                dropped_sources,
                confidence,
                stripped_citations: 0,
                token_usage: TokenUsage::default(),
                processing_ms: 0,
            },
        }))
    }

    async fn post_process(&self, state: &RunState) -> Result<Advance, RunFailure> {
        let mut brief = state
            .brief
            .clone()
            .ok_or_else(|| RunFailure::internal("post-processing reached without a brief"))?;
        let stripped = enforce_citations(&mut brief);
        brief.metadata.stripped_citations += stripped;
        brief.metadata.stage_timings = state.stage_timings.clone();
        brief.metadata.processing_ms = state.processing_ms();
        brief.metadata.token_usage = state.token_usage;
        validate_value(&brief)?;
        check_citations(&brief)?;

        let mut turn_appended = state.turn_appended;
        if let Some(session_id) = state.session_id()
            && !turn_appended
        {
            let turn = Turn {
                request: state.request.clone(),
                brief: brief.clone(),
                context_summary: state.context_summary.clone().unwrap_or_default(),
                completed_at: Utc::now(),
            };
            validate_value(&turn)?;
            let ack = self.collab.context.append_turn(session_id, turn).await?;
            debug!(session_id, turns = ack.turn_count, "Turn recorded");
            turn_appended = true;
        }
        info!(
            run_id = %state.run_id,
            references = brief.references.len(),
            stripped,
            tokens = brief.metadata.token_usage.total(),
            "Brief ready"
        );
        Ok(Advance::PostProcessed {
            brief,
            turn_appended,
        })
    }
}

fn finish(state: &RunState) -> Result<FinalBrief, RunFailure> {
    state
        .outcome()
        .unwrap_or_else(|| Err(RunFailure::internal("run stopped before a terminal stage")))
}

/// Offered-source positions that make the reference list, and the sources
/// left out.
///
/// A source stays when a marker in the draft points at it or the model
/// listed its URL in `cited_sources`. Marker targets come first, then listed
/// sources in listed order. URLs that match no offered source are ignored.
/// An empty `cited_sources`, or one that selects nothing, keeps every
/// offered source.
fn select_references(
    draft: &SynthesisDraft,
    offered: &[SourceSummary],
) -> (Vec<usize>, Vec<DroppedSource>) {
    if draft.cited_sources.is_empty() {
        return ((0..offered.len()).collect(), Vec::new());
    }

    let mut kept: Vec<usize> = Vec::new();
    let mut markers: Vec<usize> = std::iter::once(&draft.narrative)
        .chain(draft.key_findings.iter())
        .flat_map(|text| cited_indices(text))
        .filter(|&n| n >= 1 && n <= offered.len())
        .map(|n| n - 1)
        .collect();
    markers.sort_unstable();
    markers.dedup();
    kept.extend(markers);

    let keys: Vec<Option<String>> = offered.iter().map(|s| normalize_url(&s.url)).collect();
    for url in &draft.cited_sources {
        let key = normalize_url(url);
        match keys.iter().position(|k| key.is_some() && *k == key) {
            Some(i) if !kept.contains(&i) => kept.push(i),
            Some(_) => {}
            None => warn!(url = %url, "Synthesis listed a source that was not offered"),
        }
    }

    if kept.is_empty() {
        return ((0..offered.len()).collect(), Vec::new());
    }

    let selected: HashSet<usize> = kept.iter().copied().collect();
    let unselected = offered
        .iter()
        .enumerate()
        .filter(|(i, _)| !selected.contains(i))
        .map(|(_, s)| DroppedSource {
            url: s.url.clone(),
            stage: Stage::Synthesize,
            reason: "not cited by the synthesis".to_string(),
        })
        .collect();
    (kept, unselected)
}

fn split_outcomes<T>(outcomes: Vec<(usize, Result<T, DroppedSource>)>) -> (Vec<T>, Vec<DroppedSource>) {
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for (_, outcome) in outcomes {
        match outcome {
            Ok(item) => kept.push(item),
            Err(d) => dropped.push(d),
        }
    }
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn offered(n: usize) -> Vec<SourceSummary> {
        (1..=n)
            .map(|i| SourceSummary {
                url: format!("https://s{i}.org/a"),
                title: format!("S{i}"),
                claims: vec!["claim".into()],
                confidence: 0.5,
            })
            .collect()
    }

    fn draft(narrative: &str, cited: &[&str]) -> SynthesisDraft {
        SynthesisDraft {
            narrative: narrative.into(),
            key_findings: vec!["finding [4]".into()],
            cited_sources: cited.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn test_no_cited_sources_keeps_everything() {
        let (kept, dropped) = select_references(&draft("text [1]", &[]), &offered(3));
        assert_eq!(kept, vec![0, 1, 2]);
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_markers_then_listed_sources() {
        let (kept, dropped) = select_references(
            &draft(
                "a [2] b [9]",
                &["https://www.s5.org/a/", "https://elsewhere.net/x", "https://s2.org/a"],
            ),
            &offered(5),
        );
        assert_eq!(kept, vec![1, 3, 4]);
        let urls: Vec<&str> = dropped.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(urls, vec!["https://s1.org/a", "https://s3.org/a"]);
        assert!(dropped.iter().all(|d| d.stage == Stage::Synthesize));
    }

    #[test]
    fn test_selection_of_nothing_keeps_everything() {
        let mut d = draft("no markers", &["https://elsewhere.net/x"]);
        d.key_findings = vec!["plain".into()];
        let (kept, dropped) = select_references(&d, &offered(2));
        assert_eq!(kept, vec![0, 1]);
        assert!(dropped.is_empty());
    }
}
