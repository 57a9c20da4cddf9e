use async_trait::async_trait;
use tracing::info;

use forgegen_core::OwnerId;
use forgegen_jobs::JobEvent;

use super::{Notifier, NotifyError};

/// Writes events to the log. Used when no fan-out channel is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, owner_id: OwnerId, event: &JobEvent) -> Result<(), NotifyError> {
        info!(
            owner_id = %owner_id,
            job_id = %event.job_id,
            job_type = %event.job_type,
            event_type = %event.event_type,
            download_url = ?event.download_url,
            deployed_url = ?event.deployed_url,
            error = ?event.error,
            "job notification"
        );
        Ok(())
    }
}
