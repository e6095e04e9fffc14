//! Scheduled publishing workflows for Crier.
//!
//! - [`PublishWorkflow`] wakes at a post's scheduled time and publishes it to
//!   every target independently, tolerating partial failure.
//! - [`FailureHandler`] resolves a post whose workflow exhausted its retries.
//! - [`Watchdog`] independently confirms every scheduled post terminates.
//! - [`PublishService`] is the entry point for scheduling and cancellation.

mod aggregate;
mod config;
mod error;
mod failure;
mod notify;
mod publish;
mod resolve;
mod service;
mod terminal;
mod types;
mod watchdog;

pub use aggregate::{Aggregate, aggregate};
pub use config::{WorkflowConfig, WorkflowDeps};
pub use error::{NotifyError, WorkflowError};
pub use failure::{FailureHandler, GENERIC_FAILURE_REASON};
pub use notify::{LogNotifier, Notifier, PostSummary, WebhookNotifier};
pub use publish::PublishWorkflow;
pub use resolve::effective_content;
pub use service::{PostReport, PublishService};
pub use types::{
    CancelRequest, PUBLISH_JOB, PublishReport, ScheduleRequest, TargetOutcome, WATCHDOG_JOB,
    WorkflowState,
};
pub use watchdog::{STUCK_REASON, Watchdog};
