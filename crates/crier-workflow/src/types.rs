//! Workflow requests and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crier_store::TargetStatus;

/// Job kind of the publish workflow.
pub const PUBLISH_JOB: &str = "publish";

/// Job kind of the watchdog.
pub const WATCHDOG_JOB: &str = "watchdog";

/// Request to publish a post at a time. Also the payload of publish and watchdog jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub post_id: String,
    pub scheduled_for: DateTime<Utc>,
}

/// Request to abandon a post's pending work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub post_id: String,
}

/// Where a publish run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    DoneSuccess,
    DoneFailure,
    /// Post was gone, no longer scheduled, or rescheduled.
    Skipped,
}

/// Outcome of one target in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub target: String,
    pub status: TargetStatus,
    pub external_ref: Option<String>,
    pub failure_detail: Option<String>,
}

/// Structured result of one publish run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    pub post_id: String,
    pub state: WorkflowState,
    pub outcomes: Vec<TargetOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    /// Whether this run wrote the post's terminal status.
    pub finalized: bool,
}

impl PublishReport {
    pub(crate) fn skipped(post_id: &str) -> Self {
        Self {
            post_id: post_id.to_string(),
            state: WorkflowState::Skipped,
            outcomes: Vec::new(),
            succeeded: 0,
            failed: 0,
            finalized: false,
        }
    }
}
