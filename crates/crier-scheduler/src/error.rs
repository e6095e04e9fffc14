//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] crier_store::StoreError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// No handler registered for a job kind.
    #[error("no handler registered for job kind '{0}'")]
    NoHandler(String),

    /// Job payload could not be decoded.
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),

    /// Job execution failed.
    #[error("job execution failed: {0}")]
    ExecutionFailed(String),
}

impl SchedulerError {
    /// Whether another attempt of the same job could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SchedulerError::NoHandler(_) | SchedulerError::InvalidPayload(_)
        )
    }
}
