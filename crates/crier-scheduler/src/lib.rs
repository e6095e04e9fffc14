//! Durable job scheduler for Crier.
//!
//! This crate provides a persistent scheduler that:
//! - Stores jobs as rows with a `run_at` wake-up time (durable sleep)
//! - Survives crashes and restarts, replaying interrupted jobs
//! - Memoizes completed steps so replays skip finished work
//! - Retries failed jobs with exponential backoff, then signals exhaustion
//! - Cancels pending jobs by correlation key

mod error;
mod scheduler;
mod steps;
mod types;

pub use error::SchedulerError;
pub use scheduler::{JobHandler, Scheduler, SchedulerConfig};
pub use steps::Steps;
pub use types::{Job, JobStatus, RetryPolicy};
