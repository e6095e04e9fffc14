//! Checkpointed steps.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crier_store::Store;

use crate::SchedulerError;

/// Step memoization scoped to one job.
///
/// A step whose output was recorded by an earlier attempt returns that output
/// instead of running again.
#[derive(Clone)]
pub struct Steps {
    store: Arc<Store>,
    job_id: String,
}

impl Steps {
    pub fn new(store: Arc<Store>, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Run `f` once per (job, key) across all attempts of this job.
    pub async fn run<T, E, F, Fut>(&self, key: &str, f: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<SchedulerError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(raw) = self.recorded(key)? {
            debug!(job_id = %self.job_id, step = key, "replaying recorded step");
            return serde_json::from_str(&raw).map_err(|e| SchedulerError::from(e).into());
        }

        let output = f().await?;

        let raw = serde_json::to_string(&output).map_err(SchedulerError::from)?;
        self.store
            .save_checkpoint(&self.job_id, key, &raw, Utc::now())
            .map_err(SchedulerError::from)?;
        Ok(output)
    }

    /// Whether `key` already completed in an earlier attempt.
    pub fn is_recorded(&self, key: &str) -> Result<bool, SchedulerError> {
        Ok(self.store.checkpoint(&self.job_id, key)?.is_some())
    }

    fn recorded(&self, key: &str) -> Result<Option<String>, SchedulerError> {
        Ok(self.store.checkpoint(&self.job_id, key)?)
    }
}
