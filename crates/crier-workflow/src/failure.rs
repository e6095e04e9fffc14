//! Resolution of posts whose publish workflow gave up.

use tracing::{info, warn};

use crier_store::{PostStatus, TerminalUpdate};

use crate::notify::notify_owner;
use crate::terminal::finalize;
use crate::{WorkflowDeps, WorkflowError};

/// Reason recorded on a post whose workflow exhausted its retries.
pub const GENERIC_FAILURE_REASON: &str = "publishing failed after repeated errors";

/// Marks a post FAILED after its workflow exhausted retries and notifies the owner once.
#[derive(Clone)]
pub struct FailureHandler {
    deps: WorkflowDeps,
}

impl FailureHandler {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }

    /// Fail `post_id` if it is still scheduled.
    ///
    /// Missing or already terminal posts are left alone. Returns true if this
    /// call failed the post.
    #[tracing::instrument(skip(self, cause))]
    pub async fn handle(&self, post_id: &str, cause: &str) -> Result<bool, WorkflowError> {
        let Some(post) = self.deps.store.find_post(post_id)? else {
            info!("post is gone, nothing to fail");
            return Ok(false);
        };
        if post.status != PostStatus::Scheduled {
            info!(status = %post.status, "post already resolved");
            return Ok(false);
        }

        let applied = finalize(
            &self.deps.store,
            post_id,
            &TerminalUpdate::failed(GENERIC_FAILURE_REASON),
        )
        .await?;
        if !applied {
            return Ok(false);
        }

        warn!(cause, "post failed after exhausting retries");
        notify_owner(
            &self.deps.store,
            self.deps.notifier.as_ref(),
            &post,
            GENERIC_FAILURE_REASON,
        )
        .await;
        Ok(true)
    }
}
