//! Worker process: adapter wiring and the two worker loops.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use forgegen_infra::blob::{BlobStore, FsBlobStore, InMemoryBlobStore};
use forgegen_infra::external::{CodeGenerator, Deployer, HttpCodeGenerator, HttpDeployer, Unconfigured};
use forgegen_infra::notify::{InMemoryNotifier, LogNotifier, Notifier};
use forgegen_infra::processor::{CodeGenerationProcessor, DeploymentProcessor};
use forgegen_infra::queue::{InMemoryQueue, JobQueue, QueueSettings};
use forgegen_infra::store::{InMemoryJobRecordStore, JobRecordStore, PostgresJobRecordStore};
use forgegen_infra::{Config, JobService, Producer, WorkerHandle, WorkerLoop, WorkerSettings, WorkerStats};
#[cfg(feature = "redis")]
use forgegen_infra::{notify::RedisPubSubNotifier, queue::RedisStreamsQueue};

/// Every collaborator the pipeline needs.
#[derive(Clone)]
pub struct Adapters {
    pub code_generation_queue: Arc<dyn JobQueue>,
    pub deployment_queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn JobRecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub notifier: Arc<dyn Notifier>,
    pub generator: Arc<dyn CodeGenerator>,
    pub deployer: Arc<dyn Deployer>,
}

impl Adapters {
    /// All in-process adapters, external services left unconfigured.
    pub fn in_memory(queue: QueueSettings) -> Self {
        Self {
            code_generation_queue: Arc::new(InMemoryQueue::new("code-generation", queue)),
            deployment_queue: Arc::new(InMemoryQueue::new("deployment", queue)),
            store: Arc::new(InMemoryJobRecordStore::new()),
            blobs: Arc::new(InMemoryBlobStore::default()),
            notifier: Arc::new(InMemoryNotifier::new()),
            generator: Arc::new(Unconfigured),
            deployer: Arc::new(Unconfigured),
        }
    }

    /// Pick adapters from configuration; unset endpoints fall back to
    /// in-process or disabled adapters.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let (code_generation_queue, deployment_queue, notifier) = messaging(config).await?;

        let store: Arc<dyn JobRecordStore> = match &config.database_url {
            Some(url) => {
                let store = PostgresJobRecordStore::connect(url)
                    .await
                    .context("failed to connect to Postgres")?;
                store.ensure_schema().await.context("failed to create job_records table")?;
                info!("using Postgres job record store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; job records are kept in memory");
                Arc::new(InMemoryJobRecordStore::new())
            }
        };

        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.blob_dir, &config.blob_base_url));
        info!(root = %config.blob_dir.display(), base_url = %config.blob_base_url, "using filesystem blob store");

        let generator: Arc<dyn CodeGenerator> = match &config.generator_url {
            Some(url) => Arc::new(
                HttpCodeGenerator::new(url.as_str(), config.external_timeout)
                    .context("failed to build code generation client")?,
            ),
            None => {
                warn!("GENERATOR_URL not set; code generation jobs will fail");
                Arc::new(Unconfigured)
            }
        };

        let deployer: Arc<dyn Deployer> = match &config.deployer_url {
            Some(url) => Arc::new(
                HttpDeployer::new(url.as_str(), config.external_timeout).context("failed to build deployment client")?,
            ),
            None => {
                warn!("DEPLOYER_URL not set; deployment jobs will fail");
                Arc::new(Unconfigured)
            }
        };

        Ok(Self {
            code_generation_queue,
            deployment_queue,
            store,
            blobs,
            notifier,
            generator,
            deployer,
        })
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.code_generation_queue.clone(), self.deployment_queue.clone())
    }
}

type Messaging = (Arc<dyn JobQueue>, Arc<dyn JobQueue>, Arc<dyn Notifier>);

#[cfg(feature = "redis")]
async fn messaging(config: &Config) -> anyhow::Result<Messaging> {
    let Some(url) = &config.redis_url else {
        return Ok(in_process_messaging(config));
    };

    let code_generation = RedisStreamsQueue::new(url, &config.code_generation_queue, config.queue)
        .context("failed to create code generation queue")?;
    code_generation
        .ensure_consumer_group()
        .await
        .context("failed to create code generation consumer group")?;

    let deployment = RedisStreamsQueue::new(url, &config.deployment_queue, config.queue)
        .context("failed to create deployment queue")?;
    deployment
        .ensure_consumer_group()
        .await
        .context("failed to create deployment consumer group")?;

    let notifier = RedisPubSubNotifier::new(url).context("failed to create notifier")?;
    info!("using Redis Streams queues and Redis pub/sub notifications");
    Ok((Arc::new(code_generation), Arc::new(deployment), Arc::new(notifier)))
}

#[cfg(not(feature = "redis"))]
async fn messaging(config: &Config) -> anyhow::Result<Messaging> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but this build lacks the `redis` feature");
    }
    Ok(in_process_messaging(config))
}

fn in_process_messaging(config: &Config) -> Messaging {
    warn!("no Redis configured; queues are in-process and notifications are only logged");
    (
        Arc::new(InMemoryQueue::new(config.code_generation_queue.as_str(), config.queue)),
        Arc::new(InMemoryQueue::new(config.deployment_queue.as_str(), config.queue)),
        Arc::new(LogNotifier),
    )
}

/// Statistics of both loops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppStats {
    pub code_generation: WorkerStats,
    pub deployment: WorkerStats,
}

/// The two running worker loops plus the request-side service over the same adapters.
pub struct WorkerApp {
    code_generation: WorkerHandle,
    deployment: WorkerHandle,
    service: JobService,
}

impl WorkerApp {
    pub fn start(adapters: Adapters, settings: WorkerSettings) -> Self {
        let code_generation = CodeGenerationProcessor::new(
            adapters.store.clone(),
            adapters.blobs.clone(),
            adapters.notifier.clone(),
            adapters.generator.clone(),
        );
        let deployment =
            DeploymentProcessor::new(adapters.store.clone(), adapters.notifier.clone(), adapters.deployer.clone());

        let code_generation = WorkerLoop::new(
            adapters.code_generation_queue.clone(),
            Arc::new(code_generation),
            settings.clone(),
        )
        .spawn();
        let deployment = WorkerLoop::new(adapters.deployment_queue.clone(), Arc::new(deployment), settings).spawn();

        let service = JobService::new(adapters.store.clone(), adapters.producer());
        Self {
            code_generation,
            deployment,
            service,
        }
    }

    pub fn service(&self) -> &JobService {
        &self.service
    }

    pub fn stats(&self) -> AppStats {
        AppStats {
            code_generation: self.code_generation.stats(),
            deployment: self.deployment.stats(),
        }
    }

    /// Stop both loops and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> AppStats {
        self.code_generation.stop();
        self.deployment.stop();
        let (code_generation, deployment) = tokio::join!(self.code_generation.shutdown(), self.deployment.shutdown());
        AppStats {
            code_generation,
            deployment,
        }
    }
}
