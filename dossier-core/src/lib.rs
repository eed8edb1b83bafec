//! # Dossier Core
//!
//! Core library for Dossier, a research-brief generator.
//! Provides the schema contracts between stages, the LLM and search
//! gateways, content fetching, session history and the workflow
//! orchestrator that ties them together.

pub mod circuit;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod llm;
pub mod persistence;
pub mod schema;
pub mod search;
pub mod trace;
pub mod types;
pub mod workflow;

// Re-export commonly used types at the crate root.
pub use config::{DossierConfig, load_config};
pub use context::{Ack, ContextStore, FileContextStore, InMemoryContextStore};
pub use error::{DossierError, FailureKind, LlmError, Result, RunFailure, ValidationError};
pub use fetch::{ContentFetcher, HttpContentFetcher, StaticContentFetcher};
pub use llm::{LlmGateway, LlmProvider, MockLlmProvider, Prompt, Reply};
pub use schema::{Contract, SchemaKind, check_citations, check_source_refs, validate, validate_value};
pub use search::{MockSearchProvider, SearchGateway, SearchProvider};
pub use trace::{MemoryTraceSink, TraceEvent, TraceSink, TracingSink};
pub use types::{
    BriefRequest, BriefResponse, Constraints, ContextSummary, FinalBrief, Reference,
    ResearchDepth, SearchResult, SearchResultSet, SessionStats, SourceSummary, TokenUsage, Turn,
};
pub use workflow::{
    CheckpointStore, Collaborators, FileCheckpointStore, InMemoryCheckpointStore, Orchestrator,
    RunState, Stage, WorkflowSettings,
};
