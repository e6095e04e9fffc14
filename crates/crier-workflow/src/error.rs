//! Error types for the workflows.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crier_scheduler::SchedulerError;
use crier_store::StoreError;

/// Errors raised by workflows and the publish service.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Scheduler error.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Post not found.
    #[error("post not found: {0}")]
    PostNotFound(String),

    /// Scheduled time is not in the future.
    #[error("scheduled time {at} is not in the future")]
    NotInFuture { at: DateTime<Utc> },

    /// Post has no targets to publish to.
    #[error("post {0} has no targets")]
    NoTargets(String),

    /// Operation requires a scheduled post.
    #[error("post {id} is {status}, expected SCHEDULED")]
    NotScheduled {
        id: String,
        status: crier_store::PostStatus,
    },
}

impl From<WorkflowError> for SchedulerError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Scheduler(e) => e,
            other => SchedulerError::ExecutionFailed(other.to_string()),
        }
    }
}

/// Errors delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Webhook answered with a non-success status.
    #[error("webhook returned HTTP {0}")]
    Rejected(u16),
}
