//! Deployment processor.
//!
//! `queued → deploying → success | failed`. Subscribers hear `deploying`
//! and then the terminal state.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use forgegen_jobs::{JobData, JobMessage, JobRecordPatch, JobStatus, JobType};

use super::{JobProcessor, ProcessError, Started, announce, fail, persist, start};
use crate::external::Deployer;
use crate::notify::Notifier;
use crate::store::JobRecordStore;

pub struct DeploymentProcessor {
    store: Arc<dyn JobRecordStore>,
    notifier: Arc<dyn Notifier>,
    deployer: Arc<dyn Deployer>,
}

impl DeploymentProcessor {
    pub fn new(store: Arc<dyn JobRecordStore>, notifier: Arc<dyn Notifier>, deployer: Arc<dyn Deployer>) -> Self {
        Self {
            store,
            notifier,
            deployer,
        }
    }
}

#[async_trait]
impl JobProcessor for DeploymentProcessor {
    fn job_type(&self) -> JobType {
        JobType::Deployment
    }

    #[instrument(
        skip(self, message),
        fields(job_id = %message.id, owner_id = %message.owner_id(), job_type = %message.job_type())
    )]
    async fn process(&self, message: &JobMessage) -> Result<(), ProcessError> {
        let JobData::Deployment(data) = &message.data else {
            return Err(ProcessError::WrongJobType {
                expected: JobType::Deployment,
                actual: message.job_type(),
            });
        };
        let (job_id, owner_id) = (message.id, data.owner_id);

        let record = match start(&*self.store, message).await? {
            Started::Running(record) => record,
            Started::AlreadyFinished(status) => {
                info!(%status, "job already finished; skipping redelivery");
                return Ok(());
            }
        };
        announce(&*self.notifier, &record).await;

        match self.deployer.deploy(job_id, data).await {
            Ok(deployment) => {
                let patch = JobRecordPatch::status(JobStatus::Success).with_deployed_url(deployment.url);
                let record = persist(&*self.store, job_id, owner_id, patch).await?;
                info!(environment = %data.environment, "deployment succeeded");
                announce(&*self.notifier, &record).await;
                Ok(())
            }
            Err(e) => {
                warn!(environment = %data.environment, error = %e, "deployment failed");
                Err(fail(&*self.store, &*self.notifier, job_id, owner_id, e.to_string()).await)
            }
        }
    }
}
