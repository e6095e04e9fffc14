//! Workflow configuration and injected dependencies.

use std::sync::Arc;

use chrono::Duration;

use crier_gateway::Publisher;
use crier_store::Store;

use crate::Notifier;

/// Workflow tuning.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// How long after the scheduled time the watchdog checks for termination.
    pub grace_period: Duration,
    /// Targets published at the same time within one post.
    pub target_concurrency: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::minutes(5),
            target_concurrency: 4,
        }
    }
}

/// Shared handles every workflow needs. Built once in `main`.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub store: Arc<Store>,
    pub publisher: Arc<dyn Publisher>,
    pub notifier: Arc<dyn Notifier>,
    pub config: WorkflowConfig,
}
