//! Error types for the publishing gateway.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors constructing the gateway client.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("invalid gateway configuration: {0}")]
    InvalidConfig(String),
}

/// A rejected or failed publish for one target. Recorded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
pub struct PublishFailure {
    /// HTTP status, absent for transport failures.
    pub http_status: Option<u16>,
    pub message: String,
    pub code: Option<String>,
}

impl PublishFailure {
    pub fn new(http_status: Option<u16>, message: impl Into<String>, code: Option<String>) -> Self {
        Self {
            http_status,
            message: message.into(),
            code,
        }
    }

    /// A failure that never reached the API.
    pub fn transport(message: impl Into<String>, code: &str) -> Self {
        Self::new(None, message, Some(code.to_string()))
    }
}

impl fmt::Display for PublishFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.http_status, &self.code) {
            (Some(status), Some(code)) => write!(f, "HTTP {} [{}]: {}", status, code, self.message),
            (Some(status), None) => write!(f, "HTTP {}: {}", status, self.message),
            (None, Some(code)) => write!(f, "[{}]: {}", code, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_status_and_code() {
        let failure = PublishFailure::new(Some(400), "media too large", Some("156".into()));
        assert_eq!(failure.to_string(), "HTTP 400 [156]: media too large");
    }

    #[test]
    fn display_transport_failure() {
        let failure = PublishFailure::transport("request timed out", "timeout");
        assert_eq!(failure.to_string(), "[timeout]: request timed out");
    }
}
