//! Redis pub/sub notifier.
//!
//! Publishes each event as JSON on `forgegen:notifications:<ownerId>`.
//! Pub/sub is not durable; subscribers that are offline miss events.

use async_trait::async_trait;
use redis::AsyncCommands;

use forgegen_core::OwnerId;
use forgegen_jobs::JobEvent;

use super::{Notifier, NotifyError};

const CHANNEL_PREFIX: &str = "forgegen:notifications";

#[derive(Debug, Clone)]
pub struct RedisPubSubNotifier {
    client: redis::Client,
}

impl RedisPubSubNotifier {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, NotifyError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| NotifyError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn channel_for(owner_id: OwnerId) -> String {
        format!("{CHANNEL_PREFIX}:{owner_id}")
    }
}

#[async_trait]
impl Notifier for RedisPubSubNotifier {
    async fn notify(&self, owner_id: OwnerId, event: &JobEvent) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(event).map_err(|e| NotifyError::Serialization(e.to_string()))?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| NotifyError::Unavailable(e.to_string()))?;

        let _: i64 = conn
            .publish(Self::channel_for(owner_id), payload)
            .await
            .map_err(|e| NotifyError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_is_per_owner() {
        let owner = OwnerId::new();
        assert_eq!(
            RedisPubSubNotifier::channel_for(owner),
            format!("forgegen:notifications:{owner}")
        );
    }
}
