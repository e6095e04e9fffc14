//! Job scheduler implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crier_store::Store;

use crate::{Job, RetryPolicy, SchedulerError, Steps};

/// Minimum sleep duration between scheduler checks.
const MIN_SLEEP_SECS: u64 = 1;

/// Maximum sleep duration between scheduler checks.
const MAX_SLEEP_SECS: u64 = 60;

/// Executes jobs of one kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of `job`. Completed steps are replayed through `steps`.
    async fn run(&self, job: &Job, steps: &Steps) -> Result<(), SchedulerError>;

    /// Called once when `job` fails for the last time.
    async fn on_exhausted(&self, _job: &Job, _error: &str) {}
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub retry: RetryPolicy,
    /// Jobs executing at the same time, across all kinds.
    pub max_concurrent_jobs: usize,
    /// Jobs claimed per poll.
    pub claim_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_jobs: 16,
            claim_batch: 32,
        }
    }
}

/// The job scheduler.
pub struct Scheduler {
    store: Arc<Store>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(store: Arc<Store>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            store,
            handlers: HashMap::new(),
            config,
            permits,
        }
    }

    /// Register the handler for a job kind.
    pub fn with_handler(mut self, kind: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Build a pending job under this scheduler's retry policy without storing it.
    pub fn prepare<P: Serialize>(
        &self,
        kind: &str,
        correlation_key: &str,
        payload: &P,
        run_at: DateTime<Utc>,
    ) -> Result<Job, SchedulerError> {
        Ok(Job::new(
            kind,
            correlation_key,
            serde_json::to_value(payload)?,
            run_at,
            self.config.retry.max_attempts(),
        ))
    }

    /// Persist a new job that wakes at `run_at`.
    #[tracing::instrument(skip(self, payload))]
    pub fn enqueue<P: Serialize>(
        &self,
        kind: &str,
        correlation_key: &str,
        payload: &P,
        run_at: DateTime<Utc>,
    ) -> Result<Job, SchedulerError> {
        let job = self.prepare(kind, correlation_key, payload, run_at)?;
        self.store.insert_job(&job.to_record()?)?;
        debug!(job_id = %job.id, %run_at, "enqueued job");
        Ok(job)
    }

    /// Cancel every pending job for `correlation_key`.
    ///
    /// A job that is already running finishes its attempt.
    pub fn cancel(&self, correlation_key: &str) -> Result<usize, SchedulerError> {
        let cancelled = self.store.cancel_jobs(correlation_key, Utc::now())?;
        info!(correlation_key, cancelled, "cancelled pending jobs");
        Ok(cancelled)
    }

    /// All jobs for `correlation_key`.
    pub fn jobs_for(&self, correlation_key: &str) -> Result<Vec<Job>, SchedulerError> {
        self.store
            .jobs_for(correlation_key)?
            .into_iter()
            .map(Job::from_record)
            .collect()
    }

    /// Get a job by id.
    pub fn get_job(&self, id: &str) -> Result<Job, SchedulerError> {
        let record = self
            .store
            .get_job(id)?
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        Job::from_record(record)
    }

    /// Make jobs interrupted by a previous process due again.
    pub fn recover(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let reset = self.store.reset_running_jobs(now)?;
        if reset > 0 {
            warn!(count = reset, "replaying jobs interrupted by shutdown or crash");
        }
        Ok(reset)
    }

    /// Run the scheduler loop until `shutdown` flips to true.
    ///
    /// Jobs already running when shutdown is requested are awaited.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler starting");

        if let Err(e) = self.recover(Utc::now()) {
            error!(error = %e, "failed to recover interrupted jobs");
        }

        let mut running = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                info!("scheduler shutting down");
                break;
            }

            if let Err(e) = self.dispatch(Utc::now(), &mut running) {
                error!(error = %e, "failed to claim due jobs");
            }

            let sleep_duration = self.calculate_sleep_duration(Utc::now());

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("shutdown sender dropped");
                        break;
                    }
                }
                _ = sleep(sleep_duration) => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "job task panicked");
                    }
                }
            }
        }

        if !running.is_empty() {
            info!(in_flight = running.len(), "waiting for running jobs");
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "job task panicked");
            }
        }

        info!("scheduler shut down gracefully");
    }

    /// Claim and run every job due at `now`, waiting for all of them.
    ///
    /// Returns the number of jobs started.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let mut running = JoinSet::new();
        let started = self.dispatch(now, &mut running)?;
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "job task panicked");
            }
        }
        Ok(started)
    }

    /// Claim due jobs up to the free concurrency and spawn them onto `running`.
    fn dispatch(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        running: &mut JoinSet<()>,
    ) -> Result<usize, SchedulerError> {
        let mut permits = Vec::new();
        while permits.len() < self.config.claim_batch {
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        if permits.is_empty() {
            return Ok(0);
        }

        let claimed = self.store.claim_due_jobs(now, permits.len())?;
        let started = claimed.len();

        for (record, permit) in claimed.into_iter().zip(permits) {
            let this = Arc::clone(self);
            running.spawn(async move {
                let _permit = permit;
                match Job::from_record(record.clone()) {
                    Ok(job) => this.execute(job, now).await,
                    Err(e) => {
                        error!(job_id = %record.id, error = %e, "undecodable job row");
                        if let Err(e) = this.store.fail_job(&record.id, &e.to_string(), Utc::now()) {
                            error!(job_id = %record.id, error = %e, "failed to record job failure");
                        }
                    }
                }
            });
        }

        Ok(started)
    }

    /// Calculate how long to sleep until the next job is due.
    pub fn calculate_sleep_duration(&self, now: DateTime<Utc>) -> std::time::Duration {
        let next_due = match self.store.next_run_at() {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "failed to read next wake-up time");
                None
            }
        };

        let secs = match next_due {
            Some(next) => {
                // round up so the loop never wakes just short of a due job
                let millis = (next - now).num_milliseconds();
                let diff = millis.saturating_add(999) / 1000;
                (diff.max(MIN_SLEEP_SECS as i64) as u64).min(MAX_SLEEP_SECS)
            }
            None => MAX_SLEEP_SECS,
        };

        std::time::Duration::from_secs(secs)
    }

    /// Execute one claimed attempt and record its outcome.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind, attempt = job.attempts))]
    async fn execute(self: Arc<Self>, job: Job, now: DateTime<Utc>) {
        debug!(correlation_key = %job.correlation_key, "executing job");

        let Some(handler) = self.handlers.get(&job.kind).cloned() else {
            let err = SchedulerError::NoHandler(job.kind.clone());
            error!(error = %err, "job failed permanently");
            if let Err(e) = self.store.fail_job(&job.id, &err.to_string(), Utc::now()) {
                error!(error = %e, "failed to record job failure");
            }
            return;
        };

        let steps = Steps::new(Arc::clone(&self.store), job.id.clone());
        let result = handler.run(&job, &steps).await;

        let recorded = match result {
            Ok(()) => {
                debug!("job completed");
                self.store.complete_job(&job.id, Utc::now())
            }
            Err(err) if err.is_retryable() && !job.is_last_attempt() => {
                let delay = self.config.retry.delay_for(job.attempts);
                let next_run = now + delay;
                warn!(
                    error = %err,
                    next_retry = %next_run,
                    remaining = job.max_attempts - job.attempts,
                    "job failed, scheduled retry"
                );
                self.store
                    .retry_job(&job.id, next_run, &err.to_string(), Utc::now())
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "job failed permanently");
                let recorded = self.store.fail_job(&job.id, &message, Utc::now());
                handler.on_exhausted(&job, &message).await;
                recorded
            }
        };

        if let Err(e) = recorded {
            error!(error = %e, "failed to record job outcome");
        }
    }
}
