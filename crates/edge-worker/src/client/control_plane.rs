//! Control plane HTTP client: token retrieval and result delivery.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use std::time::Duration;

use crate::action::{ActionResult, ResultSink};
use crate::config::ControlPlaneConfig;
use crate::error::{DispatchError, TokenError};
use crate::retry::Retryer;
use crate::token::{Token, TokenSource};

/// Header that may carry the token instead of the body.
pub const TOKEN_HEADER: &str = "X-Edge-Token";

const CLIENT_INFO_HEADER: &str = "X-Client-Info";

/// `edge-worker/<version> (<hostname>)`.
pub fn client_info() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("edge-worker/{} ({})", env!("CARGO_PKG_VERSION"), host)
}

/// HTTP client for the control plane API.
#[derive(Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    token_url: String,
    result_url: String,
    retryer: Retryer,
}

impl ControlPlaneClient {
    /// Create a client with the default retry delays.
    pub fn new(config: &ControlPlaneConfig) -> anyhow::Result<Self> {
        Self::with_retryer(config, Retryer::new(config.max_retries))
    }

    pub fn with_retryer(config: &ControlPlaneConfig, retryer: Retryer) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if !config.api_key.is_empty() {
            let mut auth = HeaderValue::from_str(&format!("ApiKey {}", config.api_key))?;
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }
        headers.insert(CLIENT_INFO_HEADER, HeaderValue::from_str(&client_info())?);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            token_url: format!("{}/api/edge/token", config.url.trim_end_matches('/')),
            result_url: config.result_url.clone(),
            retryer,
        })
    }
}

#[async_trait]
impl TokenSource for ControlPlaneClient {
    async fn fetch_token(&self) -> Result<Token, TokenError> {
        let response = self.retryer.send(|| self.client.get(&self.token_url)).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let header = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| TokenError::Decode(format!("failed to read body: {}", e)))?;

        let token = Token::decode(header.as_deref(), &body)?;
        tracing::debug!(
            owner_id = %token.owner_id,
            queues = token.queue_properties.len(),
            "Fetched token"
        );
        Ok(token)
    }
}

#[async_trait]
impl ResultSink for ControlPlaneClient {
    async fn post_result(&self, result: &ActionResult) -> Result<(), DispatchError> {
        let response = self
            .retryer
            .send(|| self.client.post(&self.result_url).json(result))
            .await
            .map_err(|e| DispatchError::Delivery(e.to_string()))?;

        match response.status() {
            StatusCode::ACCEPTED => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DispatchError::Delivery(format!("status {}: {}", status, body)))
            }
        }
    }
}
