//! Publishing gateway for Crier.
//!
//! A thin client over the external publishing API. Every call returns either a
//! [`PublishReceipt`] or a [`PublishFailure`]; transport problems, timeouts and
//! API rejections are all failures-as-data so one target's outcome never aborts
//! another's.

mod client;
mod error;
pub mod normalize;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crier_store::Content;

pub use client::{GatewayClient, GatewayConfig};
pub use error::{GatewayError, PublishFailure};

/// Proof that a target accepted a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub external_id: String,
    pub published_at: DateTime<Utc>,
}

/// Publishes content to one target through one account binding.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        target: &str,
        binding_ref: &str,
        content: &Content,
    ) -> Result<PublishReceipt, PublishFailure>;
}
