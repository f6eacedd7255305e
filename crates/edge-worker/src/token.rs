//! Control plane token: per-queue credentials and refresh pacing.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TokenError;

/// Temporary credentials for one queue.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Everything needed to poll one queue. Identified by `queue_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProperties {
    pub queue_url: String,
    pub region: String,
    pub credentials: Credentials,

    /// Seconds until the next refresh after a successful fetch.
    #[serde(default)]
    pub success_refresh_period: Option<i64>,

    /// Seconds until the next refresh after a failed fetch.
    #[serde(default)]
    pub error_refresh_period: Option<i64>,
}

impl QueueProperties {
    pub fn success_period(&self) -> Option<Duration> {
        positive_secs(self.success_refresh_period)
    }

    pub fn error_period(&self) -> Option<Duration> {
        positive_secs(self.error_refresh_period)
    }
}

fn positive_secs(value: Option<i64>) -> Option<Duration> {
    value.filter(|v| *v > 0).map(|v| Duration::from_secs(v as u64))
}

/// Token returned by the control plane. Replaced wholesale on every refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub owner_id: String,
    #[serde(default)]
    pub queue_properties: Vec<QueueProperties>,
}

impl Token {
    /// Shortest success period advertised by any queue.
    pub fn success_period(&self) -> Option<Duration> {
        self.queue_properties
            .iter()
            .filter_map(QueueProperties::success_period)
            .min()
    }

    /// Shortest error period advertised by any queue.
    pub fn error_period(&self) -> Option<Duration> {
        self.queue_properties
            .iter()
            .filter_map(QueueProperties::error_period)
            .min()
    }

    /// Decode a token carried either in a header value or in a body.
    ///
    /// The header wins when both are present. Header values may be raw JSON
    /// or base64-encoded JSON.
    pub fn decode(header: Option<&str>, body: &[u8]) -> Result<Self, TokenError> {
        if let Some(value) = header.map(str::trim).filter(|v| !v.is_empty()) {
            return Self::decode_header(value);
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(TokenError::Missing);
        }

        serde_json::from_slice(body).map_err(|e| TokenError::Decode(e.to_string()))
    }

    fn decode_header(value: &str) -> Result<Self, TokenError> {
        if value.starts_with('{') {
            return serde_json::from_str(value).map_err(|e| TokenError::Decode(e.to_string()));
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|e| TokenError::Decode(format!("invalid base64 header: {}", e)))?;
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Decode(e.to_string()))
    }
}

/// Where tokens come from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<Token, TokenError>;
}
