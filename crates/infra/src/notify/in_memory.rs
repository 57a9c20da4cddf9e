use std::sync::Mutex;

use async_trait::async_trait;

use forgegen_core::{JobId, OwnerId};
use forgegen_jobs::{JobEvent, JobEventType};

use super::{Notifier, NotifyError};
use crate::lock;

/// Records every event; for tests.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    events: Mutex<Vec<(OwnerId, JobEvent)>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(OwnerId, JobEvent)> {
        lock(&self.events).clone()
    }

    /// Event types delivered for one job, in delivery order.
    pub fn event_types_for(&self, job_id: JobId) -> Vec<JobEventType> {
        lock(&self.events)
            .iter()
            .filter(|(_, e)| e.job_id == job_id)
            .map(|(_, e)| e.event_type)
            .collect()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, owner_id: OwnerId, event: &JobEvent) -> Result<(), NotifyError> {
        lock(&self.events).push((owner_id, event.clone()));
        Ok(())
    }
}
