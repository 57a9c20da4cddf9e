//! Durable queue abstraction (one queue per job family).
//!
//! ## Delivery contract
//!
//! - **At-least-once**: a received message stays in the queue until it is
//!   acknowledged with the receipt of that delivery
//! - **Visibility timeout**: an unacknowledged delivery becomes visible again
//!   once the timeout elapses, which is the only retry mechanism
//! - **Dead-letter**: a message whose receive count would exceed
//!   `max_receive_count` is moved to the dead-letter queue instead of being delivered
//! - **No ordering**: consumers must not assume FIFO delivery

use std::time::Duration;

use async_trait::async_trait;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::{DeadLetter, InMemoryQueue};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;

/// Queue-side settings shared by every adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_receive_count: 3,
        }
    }
}

/// Opaque handle identifying one delivery of a message.
///
/// Only valid while that delivery is being processed; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    pub(crate) fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id assigned by the queue on send. Used for logging only.
pub type MessageId = String;

/// One delivery of a queued message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: String,
    pub receipt: Receipt,
    /// How many times this message has been delivered, this delivery included.
    pub receive_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("receipt {0} is no longer valid")]
    StaleReceipt(Receipt),

    #[error("queue protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue name, for logs.
    fn name(&self) -> &str;

    async fn send(&self, body: String) -> Result<MessageId, QueueError>;

    /// Long-poll for up to `max` messages, waiting at most `wait` when none are visible.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Delete the delivery identified by `receipt`.
    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError>;
}

#[async_trait]
impl<T> JobQueue for std::sync::Arc<T>
where
    T: JobQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send(&self, body: String) -> Result<MessageId, QueueError> {
        (**self).send(body).await
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>, QueueError> {
        (**self).receive(max, wait).await
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError> {
        (**self).acknowledge(receipt).await
    }
}
