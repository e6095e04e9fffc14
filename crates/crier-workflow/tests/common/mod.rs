//! Shared fixtures for workflow tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};

use crier_gateway::{PublishFailure, PublishReceipt, Publisher};
use crier_scheduler::{Scheduler, SchedulerConfig};
use crier_store::{Content, ContentOverride, Post, Store, TargetBinding};
use crier_workflow::{
    NotifyError, Notifier, PUBLISH_JOB, PostSummary, PublishService, PublishWorkflow,
    ScheduleRequest, WATCHDOG_JOB, Watchdog, WorkflowConfig, WorkflowDeps,
};

pub type Hook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCall {
    pub target: String,
    pub binding_ref: String,
    pub content: Content,
}

/// Publisher that succeeds unless told otherwise and records every call.
#[derive(Default)]
pub struct FakePublisher {
    failures: Mutex<HashMap<String, PublishFailure>>,
    hooks: Mutex<HashMap<String, Hook>>,
    calls: Mutex<Vec<PublishCall>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl FakePublisher {
    /// Every publish to `target` fails with `failure`.
    pub fn fail(&self, target: &str, failure: PublishFailure) {
        self.failures
            .lock()
            .unwrap()
            .insert(target.to_string(), failure);
    }

    /// Run `hook` once, right before the next publish to `target`.
    pub fn before(&self, target: &str, hook: Hook) {
        self.hooks.lock().unwrap().insert(target.to_string(), hook);
    }

    /// Every publish waits `delay` before answering.
    pub fn delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<PublishCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, target: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.target == target)
            .count()
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(
        &self,
        target: &str,
        binding_ref: &str,
        content: &Content,
    ) -> Result<PublishReceipt, PublishFailure> {
        let hook = self.hooks.lock().unwrap().remove(target);
        if let Some(hook) = hook {
            hook();
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(PublishCall {
                target: target.to_string(),
                binding_ref: binding_ref.to_string(),
                content: content.clone(),
            });
            calls.len()
        };

        if let Some(failure) = self.failures.lock().unwrap().get(target) {
            return Err(failure.clone());
        }
        Ok(PublishReceipt {
            external_id: format!("{}-{}", target, n),
            published_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub user_id: String,
    pub post_id: String,
    pub reason: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_failure(
        &self,
        user_id: &str,
        post: &PostSummary,
        reason: &str,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(Notification {
            user_id: user_id.to_string(),
            post_id: post.post_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// A fully wired engine over one store.
pub struct Harness {
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub service: Arc<PublishService>,
    pub publisher: Arc<FakePublisher>,
    pub notifier: Arc<RecordingNotifier>,
    pub deps: WorkflowDeps,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(Store::open_in_memory().unwrap()), WorkflowConfig::default())
    }

    pub fn with_config(config: WorkflowConfig) -> Self {
        Self::with_store(Arc::new(Store::open_in_memory().unwrap()), config)
    }

    pub fn with_store(store: Arc<Store>, config: WorkflowConfig) -> Self {
        let publisher = Arc::new(FakePublisher::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let deps = WorkflowDeps {
            store: Arc::clone(&store),
            publisher: publisher.clone(),
            notifier: notifier.clone(),
            config: config.clone(),
        };

        let scheduler = Arc::new(
            Scheduler::new(Arc::clone(&store), SchedulerConfig::default())
                .with_handler(PUBLISH_JOB, Arc::new(PublishWorkflow::new(deps.clone())))
                .with_handler(WATCHDOG_JOB, Arc::new(Watchdog::new(deps.clone()))),
        );
        let service = Arc::new(PublishService::new(Arc::clone(&scheduler), config));

        Self {
            store,
            scheduler,
            service,
            publisher,
            notifier,
            deps,
        }
    }

    /// Bind `targets` for `user`.
    pub fn connect(&self, user: &str, targets: &[&str]) {
        for target in targets {
            self.store
                .upsert_binding(&TargetBinding {
                    user_id: user.to_string(),
                    target: target.to_string(),
                    binding_ref: format!("{}-{}", user, target),
                    active: true,
                })
                .unwrap();
        }
    }

    /// Create a draft owned by `user` for `targets`.
    pub fn draft(&self, user: &str, targets: &[&str], content: Content) -> Post {
        self.draft_with(user, targets, content, |_| Vec::new())
    }

    pub fn draft_with(
        &self,
        user: &str,
        targets: &[&str],
        content: Content,
        overrides: impl FnOnce(&Post) -> Vec<ContentOverride>,
    ) -> Post {
        let post = Post::draft(user, content, targets.iter().map(|t| t.to_string()).collect());
        let overrides = overrides(&post);
        self.service.create_post(&post, &overrides).unwrap();
        post
    }

    pub fn schedule(&self, post: &Post, at: DateTime<Utc>) -> Post {
        self.service
            .schedule(&ScheduleRequest {
                post_id: post.id.clone(),
                scheduled_for: at,
            })
            .unwrap()
    }

    pub async fn tick(&self, at: DateTime<Utc>) -> usize {
        self.scheduler.tick(at).await.unwrap()
    }

    /// Tick at each pending wake-up time in order until no job is pending.
    /// Returns the tick times.
    pub async fn run_until_idle(&self) -> Vec<DateTime<Utc>> {
        let mut ticks = Vec::new();
        while let Some(at) = self.store.next_run_at().unwrap() {
            assert!(ticks.len() < 20, "jobs keep getting rescheduled: {:?}", ticks);
            self.tick(at).await;
            ticks.push(at);
        }
        ticks
    }

    pub fn post(&self, id: &str) -> Option<Post> {
        self.store.find_post(id).unwrap()
    }
}

/// A whole-second time `hours` from now.
pub fn hours_from_now(hours: i64) -> DateTime<Utc> {
    (Utc::now() + Duration::hours(hours)).trunc_subsecs(0)
}

pub fn grace() -> Duration {
    WorkflowConfig::default().grace_period
}
