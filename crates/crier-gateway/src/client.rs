//! HTTP implementation of [`Publisher`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crier_store::Content;

use crate::normalize::normalize_response;
use crate::{GatewayError, PublishFailure, PublishReceipt, Publisher};

/// Gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// Upper bound on one publish call; exceeding it is a per-target failure.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Client for the external publishing API.
pub struct GatewayClient {
    http: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest<'a> {
    post: &'a str,
    platforms: [&'a str; 1],
    #[serde(skip_serializing_if = "no_media")]
    media_urls: &'a [String],
}

fn no_media(media: &&[String]) -> bool {
    media.is_empty()
}

impl GatewayClient {
    /// Build a client. Constructed once per process and shared.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.base_url.is_empty() {
            return Err(GatewayError::InvalidConfig("base URL is empty".into()));
        }

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            timeout: config.timeout,
        })
    }

    /// Base URL of the API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn transport_failure(&self, err: reqwest::Error) -> PublishFailure {
        if err.is_timeout() {
            PublishFailure::transport(
                format!("request timed out after {}s", self.timeout.as_secs()),
                "timeout",
            )
        } else if err.is_connect() {
            PublishFailure::transport(format!("connection failed: {}", err), "connect")
        } else {
            PublishFailure::transport(format!("request failed: {}", err), "transport")
        }
    }
}

#[async_trait]
impl Publisher for GatewayClient {
    #[tracing::instrument(skip(self, target, binding_ref, content), fields(platform = target, media = content.media.len()))]
    async fn publish(
        &self,
        target: &str,
        binding_ref: &str,
        content: &Content,
    ) -> Result<PublishReceipt, PublishFailure> {
        let url = format!("{}/post", self.base_url);
        let request = PublishRequest {
            post: &content.text,
            platforms: [target],
            media_urls: &content.media,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Profile-Key", binding_ref)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_failure(e))?;

        let result = normalize_response(status, &body, target);
        match &result {
            Ok(receipt) => debug!(platform = target, external_id = %receipt.external_id, "published"),
            Err(failure) => warn!(platform = target, error = %failure, "publish rejected"),
        }
        result
    }
}
