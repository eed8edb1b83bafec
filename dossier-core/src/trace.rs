//! Append-only observability events for stages and gateway attempts.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::Stage;

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// How a single gateway attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Empty,
    SchemaViolation,
    Transient,
    Fatal,
}

/// Which gateway produced an attempt event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    Llm,
    Search,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    Stage {
        run_id: Uuid,
        stage: Stage,
        duration_ms: u64,
        outcome: StageOutcome,
        retry_count: u32,
    },
    Attempt {
        gateway: GatewayKind,
        provider: String,
        purpose: String,
        attempt: u32,
        latency_ms: u64,
        outcome: AttemptOutcome,
    },
}

/// Receiver for trace events.
pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Forwards every event to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn emit(&self, event: TraceEvent) {
        match event {
            TraceEvent::Stage {
                run_id,
                stage,
                duration_ms,
                outcome,
                retry_count,
            } => tracing::debug!(
                run_id = %run_id,
                stage = %stage,
                duration_ms,
                outcome = ?outcome,
                retry_count,
                "stage finished"
            ),
            TraceEvent::Attempt {
                gateway,
                provider,
                purpose,
                attempt,
                latency_ms,
                outcome,
            } => tracing::debug!(
                gateway = ?gateway,
                provider = %provider,
                purpose = %purpose,
                attempt,
                latency_ms,
                outcome = ?outcome,
                "gateway attempt"
            ),
        }
    }
}

/// Keeps events in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Attempt events emitted by `gateway`.
    pub fn attempts(&self, gateway: GatewayKind) -> Vec<TraceEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, TraceEvent::Attempt { gateway: g, .. } if *g == gateway))
            .collect()
    }

    /// Stages in the order they finished.
    pub fn stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TraceEvent::Stage { stage, .. } => Some(stage),
                TraceEvent::Attempt { .. } => None,
            })
            .collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn emit(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
