//! AWS SQS queue client with hot-swappable session credentials.

use async_trait::async_trait;
use aws_credential_types::Credentials as AwsCredentials;
use aws_sdk_sqs::config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

use super::{as_seconds, Message, QueueClient, QueueClientFactory};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::token::QueueProperties;

/// SQS refuses batches larger than this.
const MAX_RECEIVE_BATCH: i32 = 10;

/// SQS caps long polling at 20 seconds.
const MAX_RECEIVE_WAIT_SECS: i32 = 20;

const EXPIRED_CODES: &[&str] = &[
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidClientTokenId",
    "RequestExpired",
    "UnrecognizedClientException",
];

/// Map a provider error code to the error taxonomy.
///
/// Throttling and every unknown code are transient; only the credential
/// codes above trigger a refresh.
pub(crate) fn classify_code(code: Option<&str>, detail: String) -> QueueError {
    match code {
        Some(code) if EXPIRED_CODES.contains(&code) => QueueError::CredentialExpired(detail),
        _ => QueueError::Transient(detail),
    }
}

fn build_client(properties: &QueueProperties) -> Result<Client, QueueError> {
    if properties.queue_url.is_empty() {
        return Err(QueueError::Configuration("queue URL is empty".to_string()));
    }
    if properties.region.is_empty() {
        return Err(QueueError::Configuration(format!(
            "region is empty for {}",
            properties.queue_url
        )));
    }

    let creds = &properties.credentials;
    let expiry = creds.expiration.map(SystemTime::from);
    let credentials = AwsCredentials::new(
        creds.access_key_id.clone(),
        creds.secret_access_key.clone(),
        creds.session_token.clone(),
        expiry,
        "edge-worker-token",
    );

    let config = aws_sdk_sqs::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(properties.region.clone()))
        .credentials_provider(credentials)
        .build();

    Ok(Client::from_conf(config))
}

struct SqsInner {
    client: Client,
    properties: QueueProperties,
}

/// Queue client bound to one SQS queue.
///
/// Every call holds a read lock on the transport for its whole duration;
/// `refresh_client` takes the write lock, so in-flight calls finish on the
/// old credentials and later calls see the new ones.
pub struct SqsQueueClient {
    /// Identity of the client; refreshes never change it.
    queue_url: String,
    inner: RwLock<SqsInner>,
    expired: AtomicBool,
    receive_wait: i32,
}

impl SqsQueueClient {
    /// Create a client for the queue described by `properties`.
    pub fn new(properties: QueueProperties, config: &QueueConfig) -> Result<Self, QueueError> {
        let client = build_client(&properties)?;
        Ok(Self {
            queue_url: properties.queue_url.clone(),
            inner: RwLock::new(SqsInner { client, properties }),
            expired: AtomicBool::new(false),
            receive_wait: as_seconds(config.receive_wait).min(MAX_RECEIVE_WAIT_SECS),
        })
    }

    fn classify<E, R>(&self, queue_url: &str, operation: &str, err: SdkError<E, R>) -> QueueError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        let detail = format!("{}: {}", operation, DisplayErrorContext(&err));
        let error = classify_code(err.code(), detail);

        if error.is_credential_expired() {
            self.expired.store(true, Ordering::SeqCst);
            tracing::warn!(queue_url = %queue_url, error = %error, "Queue credentials expired");
        }

        error
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive_messages(
        &self,
        max_messages: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<Message>, QueueError> {
        let inner = self.inner.read().await;
        let queue_url = &inner.properties.queue_url;

        let output = inner
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages.clamp(1, MAX_RECEIVE_BATCH))
            .visibility_timeout(visibility_timeout)
            .wait_time_seconds(self.receive_wait)
            .send()
            .await
            .map_err(|e| self.classify(queue_url, "ReceiveMessage", e))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                Some(Message {
                    message_id: m.message_id().map(str::to_string),
                    receipt_handle: m.receipt_handle()?.to_string(),
                    body: m.body().unwrap_or_default().to_string(),
                })
            })
            .collect::<Vec<_>>();

        tracing::trace!(queue_url = %queue_url, count = messages.len(), "Received messages");
        Ok(messages)
    }

    async fn delete_message(&self, message: &Message) -> Result<(), QueueError> {
        let inner = self.inner.read().await;
        let queue_url = &inner.properties.queue_url;

        inner
            .client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(&message.receipt_handle)
            .send()
            .await
            .map_err(|e| self.classify(queue_url, "DeleteMessage", e))?;

        Ok(())
    }

    async fn change_message_visibility(
        &self,
        message: &Message,
        visibility_timeout: i32,
    ) -> Result<(), QueueError> {
        let inner = self.inner.read().await;
        let queue_url = &inner.properties.queue_url;

        inner
            .client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(&message.receipt_handle)
            .visibility_timeout(visibility_timeout)
            .send()
            .await
            .map_err(|e| self.classify(queue_url, "ChangeMessageVisibility", e))?;

        Ok(())
    }

    async fn refresh_client(&self, properties: QueueProperties) -> Result<(), QueueError> {
        if properties.queue_url != self.queue_url {
            return Err(QueueError::Configuration(format!(
                "cannot rebind {} to {}",
                self.queue_url, properties.queue_url
            )));
        }
        let client = build_client(&properties)?;

        let mut inner = self.inner.write().await;
        tracing::debug!(queue_url = %properties.queue_url, "Swapping queue credentials");
        *inner = SqsInner { client, properties };
        self.expired.store(false, Ordering::SeqCst);

        Ok(())
    }

    fn is_token_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn queue_url(&self) -> String {
        self.queue_url.clone()
    }
}

/// Builds [`SqsQueueClient`]s.
#[derive(Debug, Clone, Default)]
pub struct SqsClientFactory {
    config: QueueConfig,
}

impl SqsClientFactory {
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }
}

impl QueueClientFactory for SqsClientFactory {
    fn create(&self, properties: &QueueProperties) -> Result<Arc<dyn QueueClient>, QueueError> {
        let client = SqsQueueClient::new(properties.clone(), &self.config)?;
        Ok(Arc::new(client))
    }
}
