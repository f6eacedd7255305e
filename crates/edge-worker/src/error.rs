//! Error types shared across the edge worker.

use thiserror::Error;

/// Worker pool lifecycle errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `start` was called on a pool that is already running.
    #[error("Worker pool is already running")]
    AlreadyRunning,

    /// The pool has not been started or has already been stopped.
    #[error("Worker pool is not running")]
    NotRunning,
}

/// Poller lifecycle errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollerError {
    #[error("Poller for {0} was already started")]
    AlreadyRunning(String),

    #[error("Poller for {0} is not polling")]
    NotRunning(String),
}

/// Errors raised by a single job execution.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job left the initial state before this call.
    #[error("Job {0} is already executing")]
    AlreadyExecuting(String),

    /// The source message could not be deleted.
    #[error("Failed to delete message for job {job_id}: {source}")]
    Delete {
        job_id: String,
        #[source]
        source: QueueError,
    },

    /// The action dispatcher reported a failure.
    #[error("Dispatch failed for job {job_id}: {source}")]
    Dispatch {
        job_id: String,
        #[source]
        source: DispatchError,
    },
}

/// Queue provider errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Any failure that is expected to clear up on a later attempt.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The provider rejected the current credentials as expired or invalid.
    #[error("Credentials expired: {0}")]
    CredentialExpired(String),

    /// The queue properties could not be turned into a client.
    #[error("Invalid queue configuration: {0}")]
    Configuration(String),
}

impl QueueError {
    /// Whether this error should trigger an out-of-cycle token refresh.
    pub fn is_credential_expired(&self) -> bool {
        matches!(self, QueueError::CredentialExpired(_))
    }
}

/// Errors from HTTP calls made through the retryer.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Every attempt failed with a retryable condition.
    #[error("Giving up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The request failed in a way retrying cannot fix.
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Errors raised while fetching or decoding a token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error(transparent)]
    Http(#[from] RetryError),

    #[error("Token endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Token response carried no token")]
    Missing,

    #[error("Failed to decode token: {0}")]
    Decode(String),
}

/// Errors raised by an action dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The message body is not a valid job request.
    #[error("Invalid job body: {0}")]
    InvalidBody(String),

    /// No action with this name is mapped.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// The action ran but reported failure.
    #[error("Action {action} failed with exit code {exit_code:?}")]
    ActionFailed {
        action: String,
        exit_code: Option<i32>,
    },

    /// The action process could not be started or awaited.
    #[error("Process error: {0}")]
    Process(String),

    /// The action timed out and was killed.
    #[error("Action {action} timed out after {seconds} seconds")]
    Timeout { action: String, seconds: u64 },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The result could not be delivered.
    #[error("Result delivery failed: {0}")]
    Delivery(String),
}

/// Errors raised while managing action-source repositories.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("git {command} failed for {url}: {stderr}")]
    Git {
        command: String,
        url: String,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Processor lifecycle errors.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor is already running")]
    AlreadyRunning,

    #[error("Processor is not running")]
    NotRunning,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Failed to check out action repository: {0}")]
    Repository(#[from] RepositoryError),
}
