//! Failure notifications to post owners.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crier_store::{Post, Store};

use crate::NotifyError;

/// What the owner is told about a failed post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSummary {
    pub post_id: String,
    pub text: String,
    pub targets: Vec<String>,
}

impl From<&Post> for PostSummary {
    fn from(post: &Post) -> Self {
        Self {
            post_id: post.id.clone(),
            text: post.content.text.clone(),
            targets: post.targets.clone(),
        }
    }
}

/// Delivers failure notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_failure(
        &self,
        user_id: &str,
        post: &PostSummary,
        reason: &str,
    ) -> Result<(), NotifyError>;
}

/// Notify the owner of `post` if they opted in.
///
/// Delivery problems are logged, never returned: a lost notification must not
/// undo or retry the terminal write that triggered it.
pub(crate) async fn notify_owner(store: &Store, notifier: &dyn Notifier, post: &Post, reason: &str) {
    let wants = match store.notify_on_failure(&post.owner_id) {
        Ok(wants) => wants,
        Err(e) => {
            warn!(post_id = %post.id, error = %e, "failed to read notification preference");
            return;
        }
    };
    if !wants {
        return;
    }

    if let Err(e) = notifier
        .notify_failure(&post.owner_id, &PostSummary::from(post), reason)
        .await
    {
        warn!(post_id = %post.id, error = %e, "failure notification not delivered");
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_failure(
        &self,
        user_id: &str,
        post: &PostSummary,
        reason: &str,
    ) -> Result<(), NotifyError> {
        info!(user_id, post_id = %post.post_id, reason, "post failed to publish");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    user_id: &'a str,
    post: &'a PostSummary,
    reason: &'a str,
}

/// Posts notifications as JSON to a webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[tracing::instrument(skip(self, post), fields(post_id = %post.post_id))]
    async fn notify_failure(
        &self,
        user_id: &str,
        post: &PostSummary,
        reason: &str,
    ) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.url)
            .json(&WebhookBody {
                user_id,
                post,
                reason,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}
