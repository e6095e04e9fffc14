//! The publish workflow.
//!
//! A run is one attempt of a `publish` job. The job's persisted `run_at` is the
//! wait; by the time a run starts the post is due. A run re-reads the post,
//! resolves the owner's bindings, publishes to every target independently and
//! folds the per-target results into the post's terminal status.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crier_scheduler::{Job, JobHandler, SchedulerError, Steps};
use crier_store::{ContentOverride, Post, PostStatus, TargetBinding, TargetResult, TerminalUpdate};

use crate::aggregate::aggregate;
use crate::resolve::effective_content;
use crate::terminal::finalize;
use crate::types::{PublishReport, ScheduleRequest, TargetOutcome, WorkflowState};
use crate::{FailureHandler, WorkflowDeps, WorkflowError};

const NO_CONNECTED_TARGETS: &str = "no connected targets";
const TARGET_NOT_CONNECTED: &str = "target not connected";

/// Publishes a scheduled post to all of its targets.
#[derive(Clone)]
pub struct PublishWorkflow {
    deps: WorkflowDeps,
    failures: FailureHandler,
}

impl PublishWorkflow {
    pub fn new(deps: WorkflowDeps) -> Self {
        let failures = FailureHandler::new(deps.clone());
        Self { deps, failures }
    }

    /// Run the workflow for `request`. Targets completed by an earlier attempt
    /// of the same job are not sent again.
    #[tracing::instrument(skip(self, steps), fields(post_id = %request.post_id, job_id = %steps.job_id()))]
    pub async fn execute(
        &self,
        request: &ScheduleRequest,
        steps: &Steps,
    ) -> Result<PublishReport, WorkflowError> {
        let store = &self.deps.store;

        let Some(post) = store.find_post(&request.post_id)? else {
            info!("post no longer exists, skipping");
            return Ok(PublishReport::skipped(&request.post_id));
        };
        if post.status != PostStatus::Scheduled {
            info!(status = %post.status, "post is not scheduled, skipping");
            return Ok(PublishReport::skipped(&post.id));
        }
        if !same_instant(post.scheduled_for, request.scheduled_for) {
            info!(scheduled_for = ?post.scheduled_for, "post was rescheduled, skipping");
            return Ok(PublishReport::skipped(&post.id));
        }

        let bindings: HashMap<String, TargetBinding> = store
            .active_bindings(&post.owner_id)?
            .into_iter()
            .filter(|b| post.targets.contains(&b.target))
            .map(|b| (b.target.clone(), b))
            .collect();

        if bindings.is_empty() {
            warn!("owner has no connected targets for this post");
            let finalized = finalize(
                store,
                &post.id,
                &TerminalUpdate::failed(NO_CONNECTED_TARGETS),
            )
            .await?;
            return Ok(PublishReport {
                post_id: post.id,
                state: WorkflowState::DoneFailure,
                outcomes: Vec::new(),
                succeeded: 0,
                failed: 0,
                finalized,
            });
        }

        let overrides = store.overrides_for(&post.id)?;
        let concurrency = self.deps.config.target_concurrency.max(1);

        // every target runs to completion before the first error, if any, is raised
        let pending: Vec<_> = post
            .targets
            .iter()
            .map(|target| self.publish_target(&post, target, bindings.get(target), &overrides, steps))
            .collect();
        let attempts: Vec<Result<TargetResult, WorkflowError>> = stream::iter(pending)
            .buffered(concurrency)
            .collect()
            .await;
        let results = attempts.into_iter().collect::<Result<Vec<_>, _>>()?;

        let agg = aggregate(&results);
        let finalized = finalize(store, &post.id, &agg.update).await?;
        if !finalized {
            info!("post was resolved by another writer");
        }

        let state = if agg.update.status == PostStatus::Published {
            WorkflowState::DoneSuccess
        } else {
            WorkflowState::DoneFailure
        };
        info!(
            ?state,
            succeeded = agg.succeeded,
            failed = agg.failed,
            "publish run finished"
        );

        Ok(PublishReport {
            post_id: post.id,
            state,
            outcomes: results
                .into_iter()
                .map(|r| TargetOutcome {
                    target: r.target,
                    status: r.status,
                    external_ref: r.external_ref,
                    failure_detail: r.failure_detail,
                })
                .collect(),
            succeeded: agg.succeeded,
            failed: agg.failed,
            finalized,
        })
    }

    /// Publish to one target as a checkpointed step.
    async fn publish_target(
        &self,
        post: &Post,
        target: &str,
        binding: Option<&TargetBinding>,
        overrides: &[ContentOverride],
        steps: &Steps,
    ) -> Result<TargetResult, WorkflowError> {
        let store = &self.deps.store;

        if let Some(existing) = store.target_result(&post.id, target)?
            && existing.status.is_terminal()
        {
            debug!(platform = target, status = existing.status.as_str(), "target already resolved");
            return Ok(existing);
        }

        steps
            .run(&format!("publish:{}", target), move || async move {
                let content = effective_content(post, overrides, target);
                let pending = TargetResult::pending(&post.id, target, content.clone());

                let Some(binding) = binding else {
                    warn!(platform = target, "target has no active binding");
                    let result = pending.failed(TARGET_NOT_CONNECTED.to_string());
                    store.upsert_target_result(&result)?;
                    return Ok::<_, WorkflowError>(result);
                };

                store.upsert_target_result(&pending)?;

                let result = match self
                    .deps
                    .publisher
                    .publish(target, &binding.binding_ref, &content)
                    .await
                {
                    Ok(receipt) => {
                        info!(platform = target, external_id = %receipt.external_id, "published");
                        pending.published(receipt.external_id, receipt.published_at)
                    }
                    Err(failure) => {
                        warn!(platform = target, error = %failure, "target rejected post");
                        pending.failed(failure.to_string())
                    }
                };

                if !store.upsert_target_result(&result)? {
                    info!(platform = target, "post deleted while publishing");
                }
                Ok::<_, WorkflowError>(result)
            })
            .await
    }
}

/// Timestamps are persisted with microsecond precision.
pub(crate) fn same_instant(stored: Option<DateTime<Utc>>, requested: DateTime<Utc>) -> bool {
    stored.is_some_and(|at| at.timestamp_micros() == requested.timestamp_micros())
}

#[async_trait]
impl JobHandler for PublishWorkflow {
    async fn run(&self, job: &Job, steps: &Steps) -> Result<(), SchedulerError> {
        let request: ScheduleRequest = job.payload_as()?;
        self.execute(&request, steps).await?;
        Ok(())
    }

    async fn on_exhausted(&self, job: &Job, error: &str) {
        let post_id = job
            .payload_as::<ScheduleRequest>()
            .map(|r| r.post_id)
            .unwrap_or_else(|_| job.correlation_key.clone());

        if let Err(e) = self.failures.handle(&post_id, error).await {
            error!(post_id = %post_id, error = %e, "failure handler could not resolve post");
        }
    }
}
