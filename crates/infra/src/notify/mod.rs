//! Notifier interface and adapters.
//!
//! Notification is fire-and-forget from the pipeline's point of view: callers
//! log failures and never retry or block job completion on them.

use async_trait::async_trait;

use forgegen_core::OwnerId;
use forgegen_jobs::JobEvent;

pub mod broadcast;
pub mod in_memory;
pub mod logging;
#[cfg(feature = "redis")]
pub mod redis_pubsub;

pub use broadcast::BroadcastNotifier;
pub use in_memory::InMemoryNotifier;
pub use logging::LogNotifier;
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubNotifier;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifier unavailable: {0}")]
    Unavailable(String),

    #[error("failed to serialize event: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner_id: OwnerId, event: &JobEvent) -> Result<(), NotifyError>;
}

#[async_trait]
impl<T> Notifier for std::sync::Arc<T>
where
    T: Notifier + ?Sized,
{
    async fn notify(&self, owner_id: OwnerId, event: &JobEvent) -> Result<(), NotifyError> {
        (**self).notify(owner_id, event).await
    }
}
