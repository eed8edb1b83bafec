//! Error types for the Dossier core.
//!
//! Uses `thiserror` for public API error types. Gateway errors (`LlmError`,
//! `SearchError`, `FetchError`) stay inside their gateways or are folded into
//! a [`RunFailure`] by the orchestrator; callers of a run only ever see a
//! `RunFailure` with a [`FailureKind`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::SchemaKind;

/// Top-level error type for the Dossier core library.
#[derive(Debug, thiserror::Error)]
pub enum DossierError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A contract violation found by the schema layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{schema} failed validation at `{path}`: {rule}")]
pub struct ValidationError {
    pub schema: SchemaKind,
    pub path: String,
    pub rule: String,
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Provider returned server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Response failed schema validation: {violation}")]
    SchemaViolation { violation: ValidationError },

    #[error("No LLM provider configured")]
    NoProviders,

    #[error("All LLM providers unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

impl LlmError {
    /// Whether the error is transient and the same provider may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Timeout { .. }
                | LlmError::Connection { .. }
                | LlmError::ServerError { .. }
                | LlmError::SchemaViolation { .. }
        )
    }
}

/// Errors from search providers. Never surfaced past the search gateway.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Search provider '{provider}' request failed: {message}")]
    Request { provider: String, message: String },

    #[error("Search provider '{provider}' returned an unreadable response: {message}")]
    Parse { provider: String, message: String },

    #[error("Search provider '{provider}' timed out after {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },

    #[error("Search provider '{provider}' is missing credentials: {var}")]
    MissingCredentials { provider: String, var: String },
}

/// Errors from fetching page content.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Fetching {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },
}

/// Errors from the context and checkpoint stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O failed at {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Corrupt record at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Session id must not be empty")]
    EmptySessionId,
}

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration value: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },
}

/// Errors from workflow bookkeeping outside a running stage.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("No checkpoint found for run {run_id}")]
    RunNotFound { run_id: Uuid },

    #[error("Checkpoint operation failed: {0}")]
    Checkpoint(#[from] StoreError),
}

/// Classification of an unrecoverable run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    ValidationError,
    #[serde(rename = "LLMUnavailable")]
    LlmUnavailable,
    NoResults,
    NoUsableSources,
    Cancelled,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ValidationError => write!(f, "ValidationError"),
            FailureKind::LlmUnavailable => write!(f, "LLMUnavailable"),
            FailureKind::NoResults => write!(f, "NoResults"),
            FailureKind::NoUsableSources => write!(f, "NoUsableSources"),
            FailureKind::Cancelled => write!(f, "Cancelled"),
            FailureKind::Internal => write!(f, "Internal"),
        }
    }
}

/// The structured error a run returns instead of a partial brief.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RunFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

impl From<ValidationError> for RunFailure {
    fn from(err: ValidationError) -> Self {
        Self::new(FailureKind::ValidationError, err.to_string())
    }
}

impl From<LlmError> for RunFailure {
    fn from(err: LlmError) -> Self {
        Self::new(FailureKind::LlmUnavailable, err.to_string())
    }
}

impl From<StoreError> for RunFailure {
    fn from(err: StoreError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<WorkflowError> for RunFailure {
    fn from(err: WorkflowError) -> Self {
        Self::internal(err.to_string())
    }
}

/// Result type alias for Dossier operations.
pub type Result<T> = std::result::Result<T, DossierError>;
