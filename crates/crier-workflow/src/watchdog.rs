//! Liveness check for scheduled posts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crier_scheduler::{Job, JobHandler, SchedulerError, Steps};
use crier_store::{JobRecord, JobRecordStatus, PostStatus, TerminalUpdate};

use crate::notify::notify_owner;
use crate::publish::same_instant;
use crate::terminal::finalize;
use crate::types::{PUBLISH_JOB, ScheduleRequest, WATCHDOG_JOB};
use crate::{WorkflowDeps, WorkflowError};

/// Reason recorded on a post the watchdog had to fail.
pub const STUCK_REASON: &str = "execution did not complete";

/// Fails posts still `SCHEDULED` a grace period after their scheduled time.
///
/// Runs as its own job, so it fires even if the publish job was lost. A publish
/// job that is still waiting for a retry, or whose attempt started less than a
/// grace period ago, pushes the check back instead.
#[derive(Clone)]
pub struct Watchdog {
    deps: WorkflowDeps,
}

impl Watchdog {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }

    /// Check the post named by `request` as of `now`. Returns true if it had to
    /// be failed.
    #[tracing::instrument(skip(self), fields(post_id = %request.post_id))]
    pub async fn check(
        &self,
        request: &ScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<bool, WorkflowError> {
        let store = &self.deps.store;

        let Some(post) = store.find_post(&request.post_id)? else {
            debug!("post no longer exists");
            return Ok(false);
        };
        if post.status != PostStatus::Scheduled {
            debug!(status = %post.status, "post terminated");
            return Ok(false);
        }
        if !same_instant(post.scheduled_for, request.scheduled_for) {
            // a newer watchdog covers the new time
            info!(scheduled_for = ?post.scheduled_for, "post was rescheduled");
            return Ok(false);
        }

        if let Some(publish) = self.live_publish(request, now)? {
            self.defer(request, now.max(publish.run_at), publish.max_attempts)?;
            return Ok(false);
        }

        if !finalize(store, &post.id, &TerminalUpdate::failed(STUCK_REASON)).await? {
            return Ok(false);
        }

        error!(
            scheduled_for = %request.scheduled_for,
            "post still scheduled after grace period, marked failed"
        );
        notify_owner(store, self.deps.notifier.as_ref(), &post, STUCK_REASON).await;
        Ok(true)
    }

    /// The publish job for `request` that may still finish on its own.
    fn live_publish(
        &self,
        request: &ScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, WorkflowError> {
        let grace = self.deps.config.grace_period;
        let live = self
            .deps
            .store
            .jobs_for(&request.post_id)?
            .into_iter()
            .filter(|job| job.kind == PUBLISH_JOB)
            .filter(|job| {
                serde_json::from_str::<ScheduleRequest>(&job.payload)
                    .is_ok_and(|p| same_instant(Some(p.scheduled_for), request.scheduled_for))
            })
            .find(|job| match job.status {
                JobRecordStatus::Pending => true,
                // claimed a grace period ago and still not done: lost
                JobRecordStatus::Running => job.updated_at + grace > now,
                _ => false,
            });
        Ok(live)
    }

    /// Enqueue another check a grace period after `from`.
    fn defer(
        &self,
        request: &ScheduleRequest,
        from: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<(), WorkflowError> {
        let at = from + self.deps.config.grace_period;
        let payload = serde_json::to_value(request).map_err(SchedulerError::from)?;
        let job = Job::new(WATCHDOG_JOB, &request.post_id, payload, at, max_attempts);
        self.deps.store.insert_job(&job.to_record()?)?;
        info!(recheck_at = %at, "publish run still in progress, check deferred");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for Watchdog {
    async fn run(&self, job: &Job, _steps: &Steps) -> Result<(), SchedulerError> {
        let request: ScheduleRequest = job.payload_as()?;
        // a claimed job's last update is the time it was picked up
        self.check(&request, job.updated_at).await?;
        Ok(())
    }
}
