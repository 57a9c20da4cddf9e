//! Job Processors: one implementation per job family.
//!
//! A processor owns every write to the Job Record during a delivery and is
//! the only component that notifies subscribers. Ordering inside one
//! delivery is always: update the record, then notify from the stored state.
//!
//! ## Outcomes
//!
//! | Situation | Result | Disposition |
//! |-----------|--------|-------------|
//! | Work succeeded (or record was already finished) | `Ok(())` | acknowledge |
//! | Work failed, `failed` persisted | `JobFailed` | acknowledge |
//! | Record missing | `Orphaned` | acknowledge |
//! | Message for another family | `WrongJobType` | acknowledge |
//! | Terminal write lost to a concurrent delivery | `Superseded` | acknowledge |
//! | Record rejected the write | `Store(Rejected)` | acknowledge |
//! | Record store unreachable | `Store(..)` | retry |
//! | Blob store unreachable before the terminal write | `Blob(..)` | retry |

use async_trait::async_trait;
use tracing::warn;

use forgegen_core::{JobId, OwnerId};
use forgegen_jobs::{JobEvent, JobMessage, JobRecord, JobRecordPatch, JobStatus, JobType};

use crate::blob::BlobError;
use crate::notify::Notifier;
use crate::store::{JobRecordStore, StoreError};

pub mod code_generation;
pub mod deployment;

pub use code_generation::CodeGenerationProcessor;
pub use deployment::DeploymentProcessor;

/// What the Worker Loop does with the delivery after a processing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delete the message.
    Acknowledge,
    /// Leave it for redelivery after the visibility timeout.
    Retry,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("job {job_id} failed: {error}")]
    JobFailed { job_id: JobId, error: String },

    #[error("no job record for {job_id} (owner {owner_id})")]
    Orphaned { job_id: JobId, owner_id: OwnerId },

    #[error("{actual} message delivered to the {expected} processor")]
    WrongJobType { expected: JobType, actual: JobType },

    #[error("job {job_id} was already finished as {status}")]
    Superseded { job_id: JobId, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("artifact upload failed: {0}")]
    Blob(#[from] BlobError),
}

impl ProcessError {
    pub fn disposition(&self) -> Disposition {
        match self {
            ProcessError::Store(e) if e.is_transient() => Disposition::Retry,
            ProcessError::Blob(e) if e.is_transient() => Disposition::Retry,
            _ => Disposition::Acknowledge,
        }
    }
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// The family this processor handles.
    fn job_type(&self) -> JobType;

    async fn process(&self, message: &JobMessage) -> Result<(), ProcessError>;
}

#[async_trait]
impl<T> JobProcessor for std::sync::Arc<T>
where
    T: JobProcessor + ?Sized,
{
    fn job_type(&self) -> JobType {
        (**self).job_type()
    }

    async fn process(&self, message: &JobMessage) -> Result<(), ProcessError> {
        (**self).process(message).await
    }
}

/// Result of moving a record into its in-progress status.
pub(crate) enum Started {
    Running(JobRecord),
    /// An earlier or concurrent delivery already finished the job.
    AlreadyFinished(JobStatus),
}

/// Transition the record to the family's in-progress status.
pub(crate) async fn start(
    store: &dyn JobRecordStore,
    message: &JobMessage,
) -> Result<Started, ProcessError> {
    let (job_id, owner_id) = (message.id, message.owner_id());
    let patch = JobRecordPatch::status(message.job_type().in_progress_status());

    match store.update(job_id, owner_id, patch).await {
        Ok(record) => Ok(Started::Running(record)),
        Err(StoreError::NotFound { .. }) => Err(ProcessError::Orphaned { job_id, owner_id }),
        Err(StoreError::Rejected(e)) if e.is_already_terminal() => {
            let status = current_status(store, job_id, owner_id).await?;
            Ok(Started::AlreadyFinished(status))
        }
        Err(e) => Err(e.into()),
    }
}

/// Apply a patch. A write rejected because the record is already terminal
/// (another delivery won) maps to `Superseded`.
pub(crate) async fn persist(
    store: &dyn JobRecordStore,
    job_id: JobId,
    owner_id: OwnerId,
    patch: JobRecordPatch,
) -> Result<JobRecord, ProcessError> {
    match store.update(job_id, owner_id, patch).await {
        Ok(record) => Ok(record),
        Err(StoreError::Rejected(e)) if e.is_already_terminal() => {
            let status = current_status(store, job_id, owner_id).await?;
            Err(ProcessError::Superseded { job_id, status })
        }
        Err(StoreError::NotFound { .. }) => Err(ProcessError::Orphaned { job_id, owner_id }),
        Err(e) => Err(e.into()),
    }
}

/// Record the failure, notify, and return `JobFailed`.
pub(crate) async fn fail(
    store: &dyn JobRecordStore,
    notifier: &dyn Notifier,
    job_id: JobId,
    owner_id: OwnerId,
    error: String,
) -> ProcessError {
    let error = if error.trim().is_empty() {
        "job failed without an error message".to_string()
    } else {
        error
    };

    match persist(store, job_id, owner_id, JobRecordPatch::failed(error.clone())).await {
        Ok(record) => {
            announce(notifier, &record).await;
            ProcessError::JobFailed { job_id, error }
        }
        Err(e) => e,
    }
}

/// Notify subscribers of the record's current state. Failures are logged only.
pub(crate) async fn announce(notifier: &dyn Notifier, record: &JobRecord) {
    let Some(event) = JobEvent::for_record(record) else {
        return;
    };
    if let Err(e) = notifier.notify(record.owner_id, &event).await {
        warn!(
            job_id = %record.id,
            owner_id = %record.owner_id,
            event_type = %event.event_type,
            error = %e,
            "failed to notify subscribers"
        );
    }
}

async fn current_status(store: &dyn JobRecordStore, job_id: JobId, owner_id: OwnerId) -> Result<JobStatus, ProcessError> {
    store
        .get(job_id, owner_id)
        .await?
        .map(|r| r.status)
        .ok_or(ProcessError::Orphaned { job_id, owner_id })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes shared by the processor tests.

    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;

    use forgegen_core::{JobId, OwnerId, ProjectId};
    use forgegen_jobs::{JobEvent, JobMessage, JobRecord, JobRecordPatch};

    use crate::notify::{Notifier, NotifyError};
    use crate::store::{InMemoryJobRecordStore, JobRecordStore, StoreError};

    pub fn ids() -> (JobId, OwnerId, ProjectId) {
        (JobId::new(), OwnerId::new(), ProjectId::new())
    }

    pub async fn seed(store: &InMemoryJobRecordStore, message: &JobMessage) -> JobRecord {
        let record = JobRecord::queued(message.id, &message.data, Utc::now());
        store.put(record.clone()).await.unwrap();
        record
    }

    /// Store whose writes fail as if the database were down.
    #[derive(Default)]
    pub struct DownStore {
        pub inner: Arc<InMemoryJobRecordStore>,
    }

    #[async_trait]
    impl JobRecordStore for DownStore {
        async fn get(&self, id: JobId, owner_id: OwnerId) -> Result<Option<JobRecord>, StoreError> {
            self.inner.get(id, owner_id).await
        }

        async fn put(&self, record: JobRecord) -> Result<(), StoreError> {
            self.inner.put(record).await
        }

        async fn update(&self, _: JobId, _: OwnerId, _: JobRecordPatch) -> Result<JobRecord, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// Notifier that always fails.
    pub struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn notify(&self, _: OwnerId, _: &JobEvent) -> Result<(), NotifyError> {
            Err(NotifyError::Unavailable("smtp down".to_string()))
        }
    }
}
