//! HTTP calls with exponential backoff.

use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

use crate::error::RetryError;

/// How a response status should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after a backoff.
    Retry,
    /// Hand the response back to the caller as-is.
    Return,
}

/// Classify a response status.
///
/// Timeouts, rate limits and server errors are retried; everything else,
/// including other client errors, is returned to the caller.
pub fn classify_status(status: StatusCode) -> RetryDecision {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        RetryDecision::Retry
    } else {
        RetryDecision::Return
    }
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Parse a `Retry-After` header given in whole seconds.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Sends requests with automatic retry.
#[derive(Debug, Clone)]
pub struct Retryer {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl Default for Retryer {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Retryer {
    /// Create a retryer with the default delays.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Create a retryer with custom delays.
    pub fn with_delays(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Backoff before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay)
    }

    /// Send the request built by `build`, retrying on retryable failures.
    ///
    /// `build` is called once per attempt. Responses with a non-retryable
    /// status are returned without checking for success.
    pub async fn send<F>(&self, build: F) -> Result<Response, RetryError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            let mut delay = self.delay_for(attempt);

            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if classify_status(status) == RetryDecision::Return {
                        return Ok(response);
                    }
                    if let Some(hint) = retry_after(&response) {
                        delay = std::cmp::min(hint, self.max_delay);
                    }
                    last_error = format!("status {}", status);
                }
                Err(e) if is_retryable_error(&e) => {
                    last_error = e.to_string();
                }
                Err(e) => return Err(RetryError::Request(e)),
            }

            if attempt < self.max_retries {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries = self.max_retries,
                    error = %last_error,
                    delay_ms = delay.as_millis() as u64,
                    "Request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(error = %last_error, "Request failed after all retries");
        Err(RetryError::Exhausted {
            attempts: self.max_retries + 1,
            last_error,
        })
    }
}
