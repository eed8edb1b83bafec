//! Research workflow: the stage graph from a request to a cited brief.
//!
//! ```text
//! Init → ContextSummarize → Plan → Search ─┬─ results ─→ Fetch → SourceSummarize
//!                                  ↑       └─ empty ──→ RetrySearch ┐
//!                                  └────────────────────────────────┘
//!        → Synthesize → PostProcess → Done          (any stage → Failed)
//! ```

pub mod checkpoint;
pub mod orchestrator;
pub mod postprocess;
pub mod prompts;
pub mod state;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use orchestrator::{Collaborators, Orchestrator, WorkflowSettings};
pub use postprocess::{cited_indices, enforce_citations};
pub use state::{Advance, RunState, Stage};
