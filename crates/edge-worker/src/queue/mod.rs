//! Remote work queue clients.

mod sqs;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::QueueError;
use crate::token::QueueProperties;

pub use sqs::{SqsClientFactory, SqsQueueClient};

/// A message received from a remote queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Provider-assigned message id.
    pub message_id: Option<String>,

    /// Handle used to delete the message or change its visibility.
    pub receipt_handle: String,

    /// Raw message body.
    pub body: String,
}

/// Credentialed client bound to one remote queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `max_messages`, hiding them for `visibility_timeout` seconds.
    async fn receive_messages(
        &self,
        max_messages: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<Message>, QueueError>;

    /// Delete a message so it is never redelivered.
    async fn delete_message(&self, message: &Message) -> Result<(), QueueError>;

    /// Reset the visibility window of a message. Zero releases it immediately.
    async fn change_message_visibility(
        &self,
        message: &Message,
        visibility_timeout: i32,
    ) -> Result<(), QueueError>;

    /// Rebuild the transport with new credentials and properties.
    async fn refresh_client(&self, properties: QueueProperties) -> Result<(), QueueError>;

    /// Whether the provider has rejected the current credentials as expired.
    fn is_token_expired(&self) -> bool;

    /// Queue this client is bound to.
    fn queue_url(&self) -> String;
}

/// Builds queue clients from token properties.
#[cfg_attr(test, mockall::automock)]
pub trait QueueClientFactory: Send + Sync {
    fn create(&self, properties: &QueueProperties) -> Result<Arc<dyn QueueClient>, QueueError>;
}

/// Duration to whole seconds, as queue providers expect.
pub fn as_seconds(duration: std::time::Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}
