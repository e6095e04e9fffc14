//! Content store for Crier.
//!
//! A single SQLite database holds both the publishable content (posts,
//! per-target overrides, per-target publish results, target bindings and
//! user preferences) and the durable job table the scheduler polls.
//!
//! ## Features
//!
//! - **Posts**: drafts and scheduled posts with ordered target sets
//! - **Results**: per-target publish results upserted by (post, target)
//! - **Jobs**: persisted `run_at` rows so waits survive restarts
//! - **Checkpoints**: memoized step outputs keyed by (job, step)

mod error;
mod jobs;
mod store;
mod types;

pub use error::StoreError;
pub use jobs::{JobRecord, JobRecordStatus};
pub use store::Store;
pub use types::*;
