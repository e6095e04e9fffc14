//! Error types for the content store.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::PostStatus;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Post not found.
    #[error("post not found: {0}")]
    PostNotFound(String),

    /// Post is in a terminal state and can no longer be changed.
    #[error("post {id} is {status} and can no longer be modified")]
    Immutable { id: String, status: PostStatus },

    /// Post failed validation.
    #[error("invalid post: {0}")]
    InvalidPost(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}
