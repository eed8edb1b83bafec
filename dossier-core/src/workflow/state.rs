//! Run state and the stage transition table.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FailureKind, RunFailure};
use crate::types::{
    BriefRequest, ContextSummary, DroppedSource, FetchedSource, FinalBrief, ResearchPlan,
    SearchResultSet, SourceSummary, StageTiming, TokenUsage, Turn,
};

/// A node in the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    ContextSummarize,
    Plan,
    Search,
    RetrySearch,
    Fetch,
    SourceSummarize,
    Synthesize,
    PostProcess,
    Done,
    Failed(FailureKind),
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed(_))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "init"),
            Stage::ContextSummarize => write!(f, "context_summarize"),
            Stage::Plan => write!(f, "plan"),
            Stage::Search => write!(f, "search"),
            Stage::RetrySearch => write!(f, "retry_search"),
            Stage::Fetch => write!(f, "fetch"),
            Stage::SourceSummarize => write!(f, "source_summarize"),
            Stage::Synthesize => write!(f, "synthesize"),
            Stage::PostProcess => write!(f, "post_process"),
            Stage::Done => write!(f, "done"),
            Stage::Failed(kind) => write!(f, "failed({kind})"),
        }
    }
}

/// The output of one completed stage.
#[derive(Debug, Clone)]
pub enum Advance {
    Initialized { history: Vec<Turn> },
    ContextReady(ContextSummary),
    Planned { plan: ResearchPlan, queries: Vec<String> },
    /// `fresh` is false when the results were already in the state.
    Searched { results: SearchResultSet, fresh: bool },
    Revised { query: String },
    Fetched {
        sources: Vec<FetchedSource>,
        dropped: Vec<DroppedSource>,
    },
    Summarized {
        summaries: Vec<SourceSummary>,
        dropped: Vec<DroppedSource>,
    },
    Synthesized(FinalBrief),
    PostProcessed { brief: FinalBrief, turn_appended: bool },
}

/// Working memory for one request. Checkpointed after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub request: BriefRequest,
    pub stage: Stage,
    #[serde(default)]
    pub history: Vec<Turn>,
    pub context_summary: Option<ContextSummary>,
    pub plan: Option<ResearchPlan>,
    #[serde(default)]
    pub active_queries: Vec<String>,
    pub search_results: Option<SearchResultSet>,
    pub fetched: Option<Vec<FetchedSource>>,
    pub source_summaries: Option<Vec<SourceSummary>>,
    #[serde(default)]
    pub dropped_sources: Vec<DroppedSource>,
    pub brief: Option<FinalBrief>,
    #[serde(default)]
    pub turn_appended: bool,
    pub retry_count: u32,
    pub search_attempts: u32,
    #[serde(default)]
    pub stage_timings: Vec<StageTiming>,
    /// Model tokens spent by completed stages.
    #[serde(default)]
    pub token_usage: TokenUsage,
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// A fresh run at `Init`. A request without a session id is given a new
    /// one, so every completed brief lands in some session.
    pub fn new(mut request: BriefRequest) -> Self {
        if request.session_id.is_none() {
            request.session_id = Some(Uuid::new_v4().to_string());
        }
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            request,
            stage: Stage::Init,
            history: Vec::new(),
            context_summary: None,
            plan: None,
            active_queries: Vec::new(),
            search_results: None,
            fetched: None,
            source_summaries: None,
            dropped_sources: Vec::new(),
            brief: None,
            turn_appended: false,
            retry_count: 0,
            search_attempts: 0,
            stage_timings: Vec::new(),
            token_usage: TokenUsage::default(),
            failure: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.request.session_id.as_deref()
    }

    /// Wall-clock time of the recorded stages.
    pub fn processing_ms(&self) -> u64 {
        self.stage_timings.iter().map(|t| t.duration_ms).sum()
    }

    /// Record the output of the current stage and move to the next one.
    ///
    /// An advance that does not belong to the current stage is a
    /// programming error and fails the run as `Internal`.
    pub fn apply(&mut self, advance: Advance, elapsed: Duration) {
        let from = self.stage;
        let next = match (from, advance) {
            (Stage::Init, Advance::Initialized { history }) => {
                self.history = history;
                Stage::ContextSummarize
            }
            (Stage::ContextSummarize, Advance::ContextReady(summary)) => {
                self.context_summary = Some(summary);
                Stage::Plan
            }
            (Stage::Plan, Advance::Planned { plan, queries }) => {
                self.plan = Some(plan);
                self.active_queries = queries;
                Stage::Search
            }
            (Stage::Search, Advance::Searched { results, fresh }) => {
                if fresh {
                    self.search_attempts += 1;
                }
                let next = if results.is_empty() {
                    Stage::RetrySearch
                } else {
                    Stage::Fetch
                };
                self.search_results = Some(results);
                next
            }
            (Stage::RetrySearch, Advance::Revised { query }) => {
                self.retry_count += 1;
                self.active_queries = vec![query];
                self.search_results = None;
                Stage::Search
            }
            (Stage::Fetch, Advance::Fetched { sources, dropped }) => {
                self.fetched = Some(sources);
                self.dropped_sources.extend(dropped);
                Stage::SourceSummarize
            }
            (Stage::SourceSummarize, Advance::Summarized { summaries, dropped }) => {
                self.source_summaries = Some(summaries);
                self.dropped_sources.extend(dropped);
                Stage::Synthesize
            }
            (Stage::Synthesize, Advance::Synthesized(brief)) => {
                self.brief = Some(brief);
                Stage::PostProcess
            }
            (
                Stage::PostProcess,
                Advance::PostProcessed {
                    brief,
                    turn_appended,
                },
            ) => {
                self.brief = Some(brief);
                self.turn_appended = turn_appended;
                Stage::Done
            }
            (stage, advance) => {
                self.fail(RunFailure::internal(format!(
                    "stage {stage} cannot accept {}",
                    advance.label()
                )));
                return;
            }
        };
        self.stage_timings.push(StageTiming {
            stage: from,
            duration_ms: elapsed.as_millis() as u64,
        });
        self.stage = next;
        self.updated_at = Utc::now();
    }

    /// Move to the terminal failed stage.
    pub fn fail(&mut self, failure: RunFailure) {
        self.stage = Stage::Failed(failure.kind);
        self.failure = Some(failure);
        self.updated_at = Utc::now();
    }

    /// The terminal outcome, or `None` while the run is still in progress.
    pub fn outcome(&self) -> Option<Result<FinalBrief, RunFailure>> {
        match self.stage {
            Stage::Done => Some(
                self.brief
                    .clone()
                    .ok_or_else(|| RunFailure::internal("run finished without a brief")),
            ),
            Stage::Failed(kind) => Some(Err(self
                .failure
                .clone()
                .unwrap_or_else(|| RunFailure::new(kind, "run failed")))),
            _ => None,
        }
    }
}

impl Advance {
    fn label(&self) -> &'static str {
        match self {
            Advance::Initialized { .. } => "initialized",
            Advance::ContextReady(_) => "context_ready",
            Advance::Planned { .. } => "planned",
            Advance::Searched { .. } => "searched",
            Advance::Revised { .. } => "revised",
            Advance::Fetched { .. } => "fetched",
            Advance::Summarized { .. } => "summarized",
            Advance::Synthesized(_) => "synthesized",
            Advance::PostProcessed { .. } => "post_processed",
        }
    }
}
