use async_trait::async_trait;
use tokio::sync::broadcast;

use forgegen_core::OwnerId;
use forgegen_jobs::JobEvent;

use super::{Notifier, NotifyError};

/// In-process fan-out to any number of subscribers.
///
/// Lossy: slow subscribers miss events once the channel capacity is exceeded,
/// and events sent with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<(OwnerId, JobEvent)>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(OwnerId, JobEvent)> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, owner_id: OwnerId, event: &JobEvent) -> Result<(), NotifyError> {
        // Err only means nobody is listening.
        let _ = self.sender.send((owner_id, event.clone()));
        Ok(())
    }
}
