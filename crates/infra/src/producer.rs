//! Producer: serializes Job Messages onto the queue of their family.
//!
//! The caller must have persisted the `queued` Job Record before enqueueing;
//! a worker may receive the message immediately.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use forgegen_core::{JobId, OwnerId, ProjectId};
use forgegen_jobs::{
    CodeGenerationData, DeploymentData, EncodeError, Environment, JobData, JobMessage, JobStatus, JobType,
};

use crate::queue::{JobQueue, MessageId, QueueError};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("failed to enqueue: {0}")]
    Queue(#[from] QueueError),

    #[error("failed to persist job record: {0}")]
    Store(#[from] StoreError),

    #[error("job {job_id} is {status}; only queued jobs can be enqueued again")]
    NotQueued { job_id: JobId, status: JobStatus },
}

/// Acknowledgement of a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: JobId,
    /// Queue-assigned delivery id. For logging only.
    pub message_id: MessageId,
}

#[derive(Clone)]
pub struct Producer {
    code_generation: Arc<dyn JobQueue>,
    deployment: Arc<dyn JobQueue>,
}

impl Producer {
    pub fn new(code_generation: Arc<dyn JobQueue>, deployment: Arc<dyn JobQueue>) -> Self {
        Self {
            code_generation,
            deployment,
        }
    }

    pub fn queue_for(&self, job_type: JobType) -> &Arc<dyn JobQueue> {
        match job_type {
            JobType::CodeGeneration => &self.code_generation,
            JobType::Deployment => &self.deployment,
        }
    }

    /// Enqueue a job whose record already exists.
    #[instrument(skip(self, data), fields(job_id = %job_id, job_type = %data.job_type()), err)]
    pub async fn enqueue(&self, job_id: JobId, data: JobData) -> Result<Enqueued, EnqueueError> {
        let message = JobMessage::new(job_id, data, Utc::now());
        let body = message.encode()?;
        let queue = self.queue_for(message.job_type());

        let message_id = queue.send(body).await?;
        info!(queue = %queue.name(), message_id = %message_id, "job enqueued");
        Ok(Enqueued { job_id, message_id })
    }

    pub async fn enqueue_code_generation(
        &self,
        job_id: JobId,
        owner_id: OwnerId,
        project_id: ProjectId,
        prompt_type: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<Enqueued, EnqueueError> {
        let data = JobData::CodeGeneration(CodeGenerationData {
            owner_id,
            project_id,
            prompt_type: prompt_type.into(),
            prompt: prompt.into(),
        });
        self.enqueue(job_id, data).await
    }

    pub async fn enqueue_deployment(
        &self,
        job_id: JobId,
        owner_id: OwnerId,
        project_id: ProjectId,
        environment: Environment,
        config: serde_json::Value,
    ) -> Result<Enqueued, EnqueueError> {
        let data = JobData::Deployment(DeploymentData {
            owner_id,
            project_id,
            environment,
            config,
        });
        self.enqueue(job_id, data).await
    }
}
