//! Scheduler types.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crier_store::{JobRecord, JobRecordStatus};

use crate::SchedulerError;

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Selects the handler.
    pub kind: String,
    /// Cancellation key shared by all jobs of one subject.
    pub correlation_key: String,
    pub payload: serde_json::Value,
    /// When this job should next run (or retry after failure).
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Attempts started so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last status change. For a running job, when the current attempt was claimed.
    pub updated_at: DateTime<Utc>,
}

/// Current status of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to run.
    #[default]
    Pending,
    /// Job is currently executing.
    Running,
    /// Job completed successfully.
    Completed,
    /// Job failed permanently or exhausted its attempts.
    Failed { error: String },
    /// Job was cancelled before it started.
    Cancelled,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        kind: impl Into<String>,
        correlation_key: impl Into<String>,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            correlation_key: correlation_key.into(),
            payload,
            run_at,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if this job is due to run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    /// Whether the running attempt is the last one allowed.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Decode the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, SchedulerError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| SchedulerError::InvalidPayload(format!("{} job {}: {}", self.kind, self.id, e)))
    }

    pub(crate) fn from_record(record: JobRecord) -> Result<Self, SchedulerError> {
        let payload = serde_json::from_str(&record.payload)?;
        let status = match record.status {
            JobRecordStatus::Pending => JobStatus::Pending,
            JobRecordStatus::Running => JobStatus::Running,
            JobRecordStatus::Completed => JobStatus::Completed,
            JobRecordStatus::Failed => JobStatus::Failed {
                error: record.last_error.clone().unwrap_or_default(),
            },
            JobRecordStatus::Cancelled => JobStatus::Cancelled,
        };

        Ok(Self {
            id: record.id,
            kind: record.kind,
            correlation_key: record.correlation_key,
            payload,
            run_at: record.run_at,
            status,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            last_error: record.last_error,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// The row this job is stored as.
    pub fn to_record(&self) -> Result<JobRecord, SchedulerError> {
        let (status, error) = match &self.status {
            JobStatus::Pending => (JobRecordStatus::Pending, None),
            JobStatus::Running => (JobRecordStatus::Running, None),
            JobStatus::Completed => (JobRecordStatus::Completed, None),
            JobStatus::Failed { error } => (JobRecordStatus::Failed, Some(error.clone())),
            JobStatus::Cancelled => (JobRecordStatus::Cancelled, None),
        };

        Ok(JobRecord {
            id: self.id.clone(),
            kind: self.kind.clone(),
            correlation_key: self.correlation_key.clone(),
            payload: serde_json::to_string(&self.payload)?,
            run_at: self.run_at,
            status,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            last_error: error.or_else(|| self.last_error.clone()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Retry policy applied to unexpected job errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::seconds(30),
            max_delay: Duration::minutes(10),
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the retry that follows the `failures`-th failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        // Exponential backoff: base, 2*base, 4*base, ... capped
        let exponent = failures.saturating_sub(1).min(16);
        let backoff = self.base_delay.num_milliseconds().saturating_mul(1i64 << exponent);
        Duration::milliseconds(backoff.min(self.max_delay.num_milliseconds()))
    }

    /// Sum of every retry delay, from the first failure to the last attempt.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts()).fold(Duration::zero(), |total, failures| {
            total + self.delay_for(failures)
        })
    }
}
