//! Request-side helper: submit jobs and poll their status.

use std::sync::Arc;

use chrono::Utc;
use tracing::{instrument, warn};

use forgegen_core::{JobId, OwnerId};
use forgegen_jobs::{CodeGenerationData, DeploymentData, JobData, JobDetails, JobRecord, JobStatus};

use crate::producer::{EnqueueError, Enqueued, Producer};
use crate::store::{JobRecordStore, StoreError};

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobRecordStore>,
    producer: Producer,
}

impl JobService {
    pub fn new(store: Arc<dyn JobRecordStore>, producer: Producer) -> Self {
        Self { store, producer }
    }

    /// Create the `queued` record, then enqueue the message referencing it.
    ///
    /// If the enqueue fails the record stays `queued` with no message in
    /// flight; the error is returned and [`Self::resubmit`] can retry it.
    #[instrument(skip(self, data), fields(owner_id = %data.owner_id(), job_type = %data.job_type()), err)]
    pub async fn submit(&self, data: JobData) -> Result<Enqueued, EnqueueError> {
        let job_id = JobId::new();
        let record = JobRecord::queued(job_id, &data, Utc::now());
        self.store.put(record).await?;

        self.producer.enqueue(job_id, data).await.inspect_err(|e| {
            warn!(job_id = %job_id, error = %e, "job record left queued without a message");
        })
    }

    /// Enqueue a still-`queued` record again.
    pub async fn resubmit(&self, job_id: JobId, owner_id: OwnerId) -> Result<Enqueued, EnqueueError> {
        let record = self
            .store
            .get(job_id, owner_id)
            .await?
            .ok_or(StoreError::NotFound { id: job_id, owner_id })?;

        if record.status != JobStatus::Queued {
            return Err(EnqueueError::NotQueued {
                job_id,
                status: record.status,
            });
        }
        self.producer.enqueue(job_id, data_of(&record)).await
    }

    /// Read-only status lookup for polling.
    pub async fn status(&self, job_id: JobId, owner_id: OwnerId) -> Result<Option<JobRecord>, StoreError> {
        self.store.get(job_id, owner_id).await
    }
}

fn data_of(record: &JobRecord) -> JobData {
    match &record.details {
        JobDetails::CodeGeneration(d) => JobData::CodeGeneration(CodeGenerationData {
            owner_id: record.owner_id,
            project_id: record.project_id,
            prompt_type: d.prompt_type.clone(),
            prompt: d.prompt.clone(),
        }),
        JobDetails::Deployment(d) => JobData::Deployment(DeploymentData {
            owner_id: record.owner_id,
            project_id: record.project_id,
            environment: d.environment,
            config: d.config.clone(),
        }),
    }
}
