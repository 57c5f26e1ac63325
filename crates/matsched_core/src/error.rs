//! Error taxonomy of the scheduling substrate.

use crate::task::TaskState;
use thiserror::Error;

/// Errors surfaced by the scheduling core.
///
/// Transient infrastructure failures (telemetry flake, webhook 5xx, sink
/// errors) are handled locally with retry/backoff and never appear here.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Unknown task, model, or structure id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad parameter shape or value, rejected before any state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Illegal lifecycle step; a programmer error at the call site.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    /// No GPU currently satisfies the resource constraints; retried next tick.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The underlying calculator raised during execution.
    #[error("executor failure: {0}")]
    ExecutorFailure(String),

    /// The per-task deadline fired.
    #[error("timed out after {0}s")]
    Timeout(u64),

    /// The task was cancelled cooperatively.
    #[error("cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedError {
    /// Whether the error leaves the task eligible for a later retry
    /// (as opposed to failing it).
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedError::ResourceUnavailable(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type SchedResult<T> = Result<T, SchedError>;
