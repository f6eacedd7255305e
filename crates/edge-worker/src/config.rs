//! Edge worker configuration.
//!
//! Values are read from `EDGE_WORKER_*` environment variables. Every numeric
//! setting that is missing, zero or negative falls back to its default.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MIN_WORKERS: usize = 1;
const DEFAULT_MAX_WORKERS: usize = 8;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_MONITOR_PERIOD_SECS: u64 = 30;
const DEFAULT_BACKLOG_SIZE: usize = 16;
const DEFAULT_POLL_WAIT_SECS: u64 = 5;
const DEFAULT_MAX_MESSAGES: usize = 10;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RECEIVE_WAIT_SECS: u64 = 10;
const DEFAULT_EXCEED_RETRY_COUNT: u32 = 3;
const DEFAULT_TOKEN_SUCCESS_SECS: u64 = 900;
const DEFAULT_TOKEN_ERROR_SECS: u64 = 30;
const DEFAULT_REPOSITORY_PULL_SECS: u64 = 300;
const DEFAULT_HTTP_MAX_RETRIES: u32 = 3;
const DEFAULT_CONTROL_PLANE_URL: &str = "http://localhost:8082";

/// Raw environment view. Numbers are signed so that negative values can be
/// detected and replaced instead of failing to parse.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    min_workers: Option<i64>,
    max_workers: Option<i64>,
    keep_alive_seconds: Option<i64>,
    monitor_period_seconds: Option<i64>,
    backlog_size: Option<i64>,
    poll_wait_seconds: Option<i64>,
    max_messages: Option<i64>,
    visibility_timeout_seconds: Option<i64>,
    receive_wait_seconds: Option<i64>,
    observation_exceed_retry_count: Option<i64>,
    token_success_refresh_seconds: Option<i64>,
    token_error_refresh_seconds: Option<i64>,
    repository_pull_seconds: Option<i64>,
    http_max_retries: Option<i64>,
    control_plane_url: Option<String>,
    api_key: Option<String>,
    result_url: Option<String>,
    action_map_path: Option<PathBuf>,
    checkout_dir: Option<PathBuf>,
}

fn positive(value: Option<i64>) -> Option<u64> {
    value.filter(|v| *v > 0).map(|v| v as u64)
}

fn secs_or(value: Option<i64>, default: u64) -> Duration {
    Duration::from_secs(positive(value).unwrap_or(default))
}

fn count_or(value: Option<i64>, default: usize) -> usize {
    positive(value).map(|v| v as usize).unwrap_or(default)
}

/// Worker pool sizing and pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers kept alive at all times.
    pub min_workers: usize,

    /// Upper bound on concurrently alive workers.
    pub max_workers: usize,

    /// Idle time after which a worker above `min_workers` exits.
    pub keep_alive: Duration,

    /// Period of the metrics report.
    pub monitor_period: Duration,

    /// Jobs that may wait for a worker once all `max_workers` are busy.
    pub backlog_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            monitor_period: Duration::from_secs(DEFAULT_MONITOR_PERIOD_SECS),
            backlog_size: DEFAULT_BACKLOG_SIZE,
        }
    }
}

impl PoolConfig {
    /// Whether the pool never grows or shrinks.
    pub fn is_fixed_size(&self) -> bool {
        self.min_workers == self.max_workers
    }
}

/// Per-queue polling behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Sleep between passes that found no capacity or no messages.
    pub wait_interval: Duration,

    /// Upper bound on messages requested in one receive call.
    pub max_messages: usize,

    /// Visibility timeout requested for received messages.
    pub visibility_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            wait_interval: Duration::from_secs(DEFAULT_POLL_WAIT_SECS),
            max_messages: DEFAULT_MAX_MESSAGES,
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
        }
    }
}

/// Job execution settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Visibility extensions beyond the first before the watchdog gives up.
    pub observation_exceed_retry_count: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            observation_exceed_retry_count: DEFAULT_EXCEED_RETRY_COUNT,
        }
    }
}

/// Queue transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Long-poll wait used by receive calls.
    pub receive_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            receive_wait: Duration::from_secs(DEFAULT_RECEIVE_WAIT_SECS),
        }
    }
}

/// Control plane endpoints and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    /// Base URL of the control plane.
    pub url: String,

    /// API key sent in the `Authorization` header.
    pub api_key: String,

    /// Where action results are posted.
    pub result_url: String,

    /// Retries for every control plane call.
    pub max_retries: u32,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CONTROL_PLANE_URL.to_string(),
            api_key: String::new(),
            result_url: default_result_url(DEFAULT_CONTROL_PLANE_URL),
            max_retries: DEFAULT_HTTP_MAX_RETRIES,
        }
    }
}

fn default_result_url(base: &str) -> String {
    format!("{}/api/edge/results", base.trim_end_matches('/'))
}

/// Orchestration pacing and local paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Token refresh period after a successful fetch, unless the token says otherwise.
    pub token_success_refresh: Duration,

    /// Token refresh period after a failed fetch.
    pub token_error_refresh: Duration,

    /// Period of the repository fast-forward loop.
    pub repository_pull: Duration,

    /// Path of the JSON action map.
    pub action_map_path: PathBuf,

    /// Directory holding repository checkouts.
    pub checkout_dir: PathBuf,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            token_success_refresh: Duration::from_secs(DEFAULT_TOKEN_SUCCESS_SECS),
            token_error_refresh: Duration::from_secs(DEFAULT_TOKEN_ERROR_SECS),
            repository_pull: Duration::from_secs(DEFAULT_REPOSITORY_PULL_SECS),
            action_map_path: PathBuf::from("actions.json"),
            checkout_dir: std::env::temp_dir().join("edge-worker-repos"),
        }
    }
}

/// Complete edge worker configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeConfig {
    pub pool: PoolConfig,
    pub poller: PollerConfig,
    pub job: JobConfig,
    pub queue: QueueConfig,
    pub control_plane: ControlPlaneConfig,
    pub processor: ProcessorConfig,
}

impl EdgeConfig {
    /// Load configuration from `EDGE_WORKER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let raw = envy::prefixed("EDGE_WORKER_").from_env::<RawConfig>()?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawConfig) -> Self {
        let defaults = ProcessorConfig::default();

        let min_workers = count_or(raw.min_workers, DEFAULT_MIN_WORKERS);
        let max_workers = count_or(raw.max_workers, DEFAULT_MAX_WORKERS).max(min_workers);

        let url = raw
            .control_plane_url
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTROL_PLANE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let result_url = raw
            .result_url
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| default_result_url(&url));

        Self {
            pool: PoolConfig {
                min_workers,
                max_workers,
                keep_alive: secs_or(raw.keep_alive_seconds, DEFAULT_KEEP_ALIVE_SECS),
                monitor_period: secs_or(raw.monitor_period_seconds, DEFAULT_MONITOR_PERIOD_SECS),
                backlog_size: count_or(raw.backlog_size, DEFAULT_BACKLOG_SIZE),
            },
            poller: PollerConfig {
                wait_interval: secs_or(raw.poll_wait_seconds, DEFAULT_POLL_WAIT_SECS),
                max_messages: count_or(raw.max_messages, DEFAULT_MAX_MESSAGES),
                visibility_timeout: secs_or(
                    raw.visibility_timeout_seconds,
                    DEFAULT_VISIBILITY_TIMEOUT_SECS,
                ),
            },
            job: JobConfig {
                observation_exceed_retry_count: positive(raw.observation_exceed_retry_count)
                    .map(|v| v as u32)
                    .unwrap_or(DEFAULT_EXCEED_RETRY_COUNT),
            },
            queue: QueueConfig {
                receive_wait: secs_or(raw.receive_wait_seconds, DEFAULT_RECEIVE_WAIT_SECS),
            },
            control_plane: ControlPlaneConfig {
                url,
                api_key: raw.api_key.unwrap_or_default(),
                result_url,
                max_retries: positive(raw.http_max_retries)
                    .map(|v| v as u32)
                    .unwrap_or(DEFAULT_HTTP_MAX_RETRIES),
            },
            processor: ProcessorConfig {
                token_success_refresh: secs_or(
                    raw.token_success_refresh_seconds,
                    DEFAULT_TOKEN_SUCCESS_SECS,
                ),
                token_error_refresh: secs_or(
                    raw.token_error_refresh_seconds,
                    DEFAULT_TOKEN_ERROR_SECS,
                ),
                repository_pull: secs_or(raw.repository_pull_seconds, DEFAULT_REPOSITORY_PULL_SECS),
                action_map_path: raw.action_map_path.unwrap_or(defaults.action_map_path),
                checkout_dir: raw.checkout_dir.unwrap_or(defaults.checkout_dir),
            },
        }
    }
}
