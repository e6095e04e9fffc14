//! Scheduling and cancellation entry points.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crier_scheduler::{Job, Scheduler};
use crier_store::{
    ContentOverride, JobRecord, Post, PostStatus, Store, StoreError, TargetResult,
};

use crate::types::{CancelRequest, PUBLISH_JOB, ScheduleRequest, WATCHDOG_JOB};
use crate::{WorkflowConfig, WorkflowError};

/// A post with its per-target results and jobs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostReport {
    pub post: Post,
    pub results: Vec<TargetResult>,
    pub jobs: Vec<Job>,
}

/// Creates, schedules and cancels posts.
///
/// Every scheduling change enqueues or cancels the post's publish and watchdog
/// jobs, keyed by post id.
pub struct PublishService {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    config: WorkflowConfig,
}

impl PublishService {
    pub fn new(scheduler: Arc<Scheduler>, config: WorkflowConfig) -> Self {
        Self {
            store: Arc::clone(scheduler.store()),
            scheduler,
            config,
        }
    }

    /// Store a draft post with its overrides.
    #[tracing::instrument(skip(self, post, overrides), fields(post_id = %post.id))]
    pub fn create_post(
        &self,
        post: &Post,
        overrides: &[ContentOverride],
    ) -> Result<(), WorkflowError> {
        post.validate()?;
        if let Some(stray) = overrides
            .iter()
            .find(|o| o.post_id != post.id || !post.targets.contains(&o.target))
        {
            return Err(StoreError::InvalidPost(format!(
                "override for unknown target '{}'",
                stray.target
            ))
            .into());
        }

        self.store.insert_post(post)?;
        for over in overrides {
            self.store.upsert_override(over)?;
        }
        info!(targets = post.targets.len(), overrides = overrides.len(), "created post");
        Ok(())
    }

    /// Schedule a draft post, or move an already scheduled one.
    #[tracing::instrument(skip(self), fields(post_id = %request.post_id))]
    pub fn schedule(&self, request: &ScheduleRequest) -> Result<Post, WorkflowError> {
        let now = Utc::now();
        if request.scheduled_for <= now {
            return Err(WorkflowError::NotInFuture {
                at: request.scheduled_for,
            });
        }

        let post = self
            .store
            .find_post(&request.post_id)?
            .ok_or_else(|| WorkflowError::PostNotFound(request.post_id.clone()))?;
        if post.targets.is_empty() {
            return Err(WorkflowError::NoTargets(post.id));
        }

        let jobs = self.jobs_for_schedule(&post.id, request.scheduled_for)?;
        let post = self
            .store
            .schedule_post_with_jobs(&post.id, request.scheduled_for, &jobs)?;

        info!(scheduled_for = %request.scheduled_for, "post scheduled");
        Ok(post)
    }

    /// Move a scheduled post to a new time.
    pub fn reschedule(&self, post_id: &str, at: DateTime<Utc>) -> Result<Post, WorkflowError> {
        let post = self
            .store
            .find_post(post_id)?
            .ok_or_else(|| WorkflowError::PostNotFound(post_id.to_string()))?;
        if post.status != PostStatus::Scheduled {
            return Err(WorkflowError::NotScheduled {
                id: post.id,
                status: post.status,
            });
        }
        self.schedule(&ScheduleRequest {
            post_id: post_id.to_string(),
            scheduled_for: at,
        })
    }

    /// Return a scheduled post to draft and drop its pending jobs.
    #[tracing::instrument(skip(self))]
    pub fn unschedule(&self, post_id: &str) -> Result<Post, WorkflowError> {
        let post = self.store.unschedule_post(post_id).map_err(not_found(post_id))?;
        self.scheduler.cancel(post_id)?;
        Ok(post)
    }

    /// Delete a draft or scheduled post and cancel its pending jobs.
    ///
    /// Published and failed posts are immutable. A run already in progress
    /// finishes or skips on its own.
    #[tracing::instrument(skip(self))]
    pub fn delete_post(&self, post_id: &str) -> Result<Post, WorkflowError> {
        let post = self
            .store
            .delete_post(post_id)?
            .ok_or_else(|| WorkflowError::PostNotFound(post_id.to_string()))?;

        if post.status == PostStatus::Scheduled {
            self.cancel(&CancelRequest {
                post_id: post.id.clone(),
            })?;
        }
        info!(status = %post.status, "post deleted");
        Ok(post)
    }

    /// Cancel every pending job of a post.
    pub fn cancel(&self, request: &CancelRequest) -> Result<usize, WorkflowError> {
        Ok(self.scheduler.cancel(&request.post_id)?)
    }

    /// Current state of a post.
    pub fn report(&self, post_id: &str) -> Result<PostReport, WorkflowError> {
        let post = self
            .store
            .find_post(post_id)?
            .ok_or_else(|| WorkflowError::PostNotFound(post_id.to_string()))?;
        let mut results = self.store.target_results(post_id)?;
        results.sort_by_key(|r| {
            post.targets
                .iter()
                .position(|t| *t == r.target)
                .unwrap_or(usize::MAX)
        });
        let jobs = self.scheduler.jobs_for(post_id)?;
        Ok(PostReport {
            post,
            results,
            jobs,
        })
    }

    /// The publish job at `at` and its watchdog a grace period later.
    fn jobs_for_schedule(
        &self,
        post_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, WorkflowError> {
        let payload = ScheduleRequest {
            post_id: post_id.to_string(),
            scheduled_for: at,
        };
        let publish = self.scheduler.prepare(PUBLISH_JOB, post_id, &payload, at)?;
        let watchdog = self.scheduler.prepare(
            WATCHDOG_JOB,
            post_id,
            &payload,
            at + self.config.grace_period,
        )?;
        Ok(vec![publish.to_record()?, watchdog.to_record()?])
    }
}

fn not_found(post_id: &str) -> impl FnOnce(StoreError) -> WorkflowError + '_ {
    move |e| match e {
        StoreError::PostNotFound(_) => WorkflowError::PostNotFound(post_id.to_string()),
        other => other.into(),
    }
}
