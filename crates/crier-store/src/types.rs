//! Content store types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Lifecycle status of a post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    /// Not scheduled; editable.
    #[default]
    Draft,
    /// Waiting for its publish workflow.
    Scheduled,
    /// At least one target accepted the post.
    Published,
    /// Every target failed, or execution was abandoned.
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "DRAFT",
            PostStatus::Scheduled => "SCHEDULED",
            PostStatus::Published => "PUBLISHED",
            PostStatus::Failed => "FAILED",
        }
    }

    /// Terminal posts are never edited, deleted, or re-resolved.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Published | PostStatus::Failed)
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(PostStatus::Draft),
            "SCHEDULED" => Ok(PostStatus::Scheduled),
            "PUBLISHED" => Ok(PostStatus::Published),
            "FAILED" => Ok(PostStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown post status '{}'", other))),
        }
    }
}

/// Text plus ordered media references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub text: String,
    #[serde(default)]
    pub media: Vec<String>,
}

impl Content {
    pub fn new(text: impl Into<String>, media: Vec<String>) -> Self {
        Self {
            text: text.into(),
            media,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text, Vec::new())
    }
}

/// The publishable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub owner_id: String,
    pub content: Content,
    /// Ordered, distinct target identifiers.
    pub targets: Vec<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: PostStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// External reference of the first successful target.
    pub external_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// Create a new draft with a fresh id.
    pub fn draft(owner_id: impl Into<String>, content: Content, targets: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            content,
            targets,
            scheduled_for: None,
            status: PostStatus::Draft,
            published_at: None,
            failure_reason: None,
            external_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the target set is distinct and the owner is set.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.owner_id.is_empty() {
            return Err(StoreError::InvalidPost("owner is required".into()));
        }
        for (i, target) in self.targets.iter().enumerate() {
            if target.is_empty() {
                return Err(StoreError::InvalidPost("empty target identifier".into()));
            }
            if self.targets[..i].contains(target) {
                return Err(StoreError::InvalidPost(format!(
                    "duplicate target '{}'",
                    target
                )));
            }
        }
        Ok(())
    }
}

/// Target-specific content replacing the post's base content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentOverride {
    pub post_id: String,
    pub target: String,
    pub content: Content,
}

/// Outcome status of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    Pending,
    Published,
    Failed,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "PENDING",
            TargetStatus::Published => "PUBLISHED",
            TargetStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TargetStatus::Pending)
    }
}

impl FromStr for TargetStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TargetStatus::Pending),
            "PUBLISHED" => Ok(TargetStatus::Published),
            "FAILED" => Ok(TargetStatus::Failed),
            other => Err(StoreError::Corrupt(format!(
                "unknown target status '{}'",
                other
            ))),
        }
    }
}

/// Per-target publish result, keyed by (post id, target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    pub post_id: String,
    pub target: String,
    /// Content actually sent to this target.
    pub content: Content,
    pub status: TargetStatus,
    pub external_ref: Option<String>,
    pub failure_detail: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TargetResult {
    pub fn pending(post_id: &str, target: &str, content: Content) -> Self {
        Self {
            post_id: post_id.to_string(),
            target: target.to_string(),
            content,
            status: TargetStatus::Pending,
            external_ref: None,
            failure_detail: None,
            published_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn published(self, external_ref: String, at: DateTime<Utc>) -> Self {
        Self {
            status: TargetStatus::Published,
            external_ref: Some(external_ref),
            failure_detail: None,
            published_at: Some(at),
            updated_at: at,
            ..self
        }
    }

    pub fn failed(self, detail: String) -> Self {
        Self {
            status: TargetStatus::Failed,
            external_ref: None,
            failure_detail: Some(detail),
            published_at: None,
            updated_at: Utc::now(),
            ..self
        }
    }
}

/// External account reference needed to publish to a target for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetBinding {
    pub user_id: String,
    pub target: String,
    pub binding_ref: String,
    pub active: bool,
}

/// Terminal write applied to a post still in `SCHEDULED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalUpdate {
    pub status: PostStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub external_ref: Option<String>,
}

impl TerminalUpdate {
    pub fn published(at: DateTime<Utc>, external_ref: Option<String>) -> Self {
        Self {
            status: PostStatus::Published,
            published_at: Some(at),
            failure_reason: None,
            external_ref,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: PostStatus::Failed,
            published_at: None,
            failure_reason: Some(reason.into()),
            external_ref: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            PostStatus::Draft,
            PostStatus::Scheduled,
            PostStatus::Published,
            PostStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<PostStatus>().unwrap(), status);
        }
        assert!("ARCHIVED".parse::<PostStatus>().is_err());
    }

    #[test]
    fn only_published_and_failed_are_terminal() {
        assert!(!PostStatus::Draft.is_terminal());
        assert!(!PostStatus::Scheduled.is_terminal());
        assert!(PostStatus::Published.is_terminal());
        assert!(PostStatus::Failed.is_terminal());
    }

    #[test]
    fn validate_rejects_duplicate_targets() {
        let post = Post::draft(
            "u1",
            Content::text("hi"),
            vec!["tiktok".into(), "instagram".into(), "tiktok".into()],
        );
        let err = post.validate().unwrap_err();
        assert!(matches!(err, StoreError::InvalidPost(msg) if msg.contains("tiktok")));
    }

    #[test]
    fn validate_rejects_missing_owner() {
        let post = Post::draft("", Content::text("hi"), vec!["x".into()]);
        assert!(post.validate().is_err());
    }

    #[test]
    fn content_media_defaults_to_empty() {
        let content: Content = serde_json::from_str(r#"{"text":"insta text"}"#).unwrap();
        assert_eq!(content, Content::text("insta text"));
    }

    #[test]
    fn failed_result_clears_success_fields() {
        let result = TargetResult::pending("p1", "x", Content::text("t"))
            .published("ext-1".into(), Utc::now())
            .failed("boom".into());
        assert_eq!(result.status, TargetStatus::Failed);
        assert!(result.external_ref.is_none());
        assert!(result.published_at.is_none());
        assert_eq!(result.failure_detail.as_deref(), Some("boom"));
    }
}
