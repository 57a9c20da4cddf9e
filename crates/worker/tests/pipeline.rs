//! Black-box pipeline tests: real worker loops over in-memory adapters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use forgegen_core::{JobId, OwnerId, ProjectId};
use forgegen_infra::blob::{BlobError, BlobStore, InMemoryBlobStore, StoredBlob};
use forgegen_infra::external::{CodeGenerator, Deployer, Deployment, DeploymentError, GenerationError};
use forgegen_infra::notify::{BroadcastNotifier, InMemoryNotifier};
use forgegen_infra::processor::{CodeGenerationProcessor, JobProcessor, ProcessError};
use forgegen_infra::queue::{InMemoryQueue, JobQueue, QueueSettings};
use forgegen_infra::store::{InMemoryJobRecordStore, JobRecordStore};
use forgegen_infra::WorkerSettings;
use forgegen_jobs::{
    CodeGenerationData, DeploymentData, Environment, GeneratedFile, JobData, JobEventType, JobMessage, JobRecord,
    JobStatus,
};
use forgegen_worker::{Adapters, WorkerApp};

struct StubGenerator {
    prefix: &'static str,
    files: usize,
    delay: Duration,
}

#[async_trait]
impl CodeGenerator for StubGenerator {
    async fn generate(&self, _: JobId, request: &CodeGenerationData) -> Result<Vec<GeneratedFile>, GenerationError> {
        tokio::time::sleep(self.delay).await;
        Ok((0..self.files)
            .map(|i| GeneratedFile {
                path: format!("{}/file_{i}.rs", self.prefix),
                content: format!("// {}\n", request.prompt),
            })
            .collect())
    }
}

struct FailingDeployer(&'static str);

#[async_trait]
impl Deployer for FailingDeployer {
    async fn deploy(&self, _: JobId, _: &DeploymentData) -> Result<Deployment, DeploymentError> {
        Err(DeploymentError::Failed(self.0.to_string()))
    }
}

struct Harness {
    code_generation_queue: Arc<InMemoryQueue>,
    store: Arc<InMemoryJobRecordStore>,
    blobs: Arc<InMemoryBlobStore>,
    notifier: Arc<InMemoryNotifier>,
    adapters: Adapters,
}

impl Harness {
    fn new() -> Self {
        let settings = QueueSettings::default();
        let code_generation_queue = Arc::new(InMemoryQueue::new("code-generation", settings));
        let store = Arc::new(InMemoryJobRecordStore::new());
        let blobs = Arc::new(InMemoryBlobStore::default());
        let notifier = Arc::new(InMemoryNotifier::new());

        let adapters = Adapters {
            code_generation_queue: code_generation_queue.clone(),
            deployment_queue: Arc::new(InMemoryQueue::new("deployment", settings)),
            store: store.clone(),
            blobs: blobs.clone(),
            notifier: notifier.clone(),
            generator: Arc::new(StubGenerator {
                prefix: "src",
                files: 3,
                delay: Duration::ZERO,
            }),
            deployer: Arc::new(FailingDeployer("connection timeout")),
        };

        Self {
            code_generation_queue,
            store,
            blobs,
            notifier,
            adapters,
        }
    }

    fn start(&self) -> WorkerApp {
        WorkerApp::start(self.adapters.clone(), fast_settings())
    }
}

fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        wait: Duration::from_millis(50),
        empty_backoff: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        ..WorkerSettings::default()
    }
}

async fn wait_for_terminal(store: &InMemoryJobRecordStore, job_id: JobId, owner_id: OwnerId) -> JobRecord {
    for _ in 0..300 {
        if let Some(record) = store.get(job_id, owner_id).await.unwrap() {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not reach a terminal status");
}

#[tokio::test]
async fn code_generation_job_completes_with_artifact() {
    let harness = Harness::new();
    let app = harness.start();
    let owner_id = OwnerId::new();

    let enqueued = app
        .service()
        .submit(JobData::CodeGeneration(CodeGenerationData {
            owner_id,
            project_id: ProjectId::new(),
            prompt_type: "feature".to_string(),
            prompt: "add a login form".to_string(),
        }))
        .await
        .unwrap();

    let record = wait_for_terminal(&harness.store, enqueued.job_id, owner_id).await;
    let stats = app.shutdown().await;

    assert_eq!(record.status, JobStatus::Completed);
    let details = record.code_generation().unwrap();
    assert_eq!(details.generated_files.len(), 3);
    let blob_key = details.blob_key.clone().unwrap();
    assert!(!blob_key.is_empty());
    assert!(harness.blobs.keys().contains(&blob_key));
    assert!(details.download_url.is_some());
    assert_eq!(
        harness.notifier.event_types_for(enqueued.job_id),
        vec![JobEventType::Completed]
    );
    assert_eq!(stats.code_generation.acknowledged, 1);
    assert!(harness.code_generation_queue.is_empty());
}

#[tokio::test]
async fn failed_deployment_records_error_and_notifies_twice() {
    let harness = Harness::new();
    let app = harness.start();
    let owner_id = OwnerId::new();

    let enqueued = app
        .service()
        .submit(JobData::Deployment(DeploymentData {
            owner_id,
            project_id: ProjectId::new(),
            environment: Environment::Production,
            config: serde_json::json!({"region": "eu-west-1"}),
        }))
        .await
        .unwrap();

    let record = wait_for_terminal(&harness.store, enqueued.job_id, owner_id).await;
    let stats = app.shutdown().await;

    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("connection timeout"));
    assert_eq!(
        harness.notifier.event_types_for(enqueued.job_id),
        vec![JobEventType::Deploying, JobEventType::Failed]
    );
    assert_eq!(stats.deployment.failed_jobs, 1);
    assert_eq!(stats.deployment.acknowledged, 1);
    assert_eq!(stats.deployment.left_for_retry, 0);
}

#[tokio::test]
async fn malformed_message_is_acknowledged_without_touching_records() {
    let harness = Harness::new();
    let app = harness.start();

    harness
        .code_generation_queue
        .send("{\"id\": 42, \"type\": \"code-generation\"".to_string())
        .await
        .unwrap();

    for _ in 0..300 {
        if app.stats().code_generation.discarded == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = app.shutdown().await;

    assert_eq!(stats.code_generation.discarded, 1);
    assert_eq!(stats.code_generation.acknowledged, 1);
    assert!(harness.code_generation_queue.is_empty());
    assert!(harness.store.is_empty());
    assert!(harness.notifier.events().is_empty());
}

/// Delays every upload, keeping a delivery between its file-list write and its terminal write.
struct SlowBlobStore {
    inner: InMemoryBlobStore,
    delay: Duration,
}

#[async_trait]
impl BlobStore for SlowBlobStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<StoredBlob, BlobError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upload(key, bytes, content_type).await
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        self.inner.download(key).await
    }
}

struct Race {
    store: Arc<InMemoryJobRecordStore>,
    message: JobMessage,
}

impl Race {
    async fn new() -> Self {
        let store = Arc::new(InMemoryJobRecordStore::new());
        let (job_id, owner_id) = (JobId::new(), OwnerId::new());
        let data = JobData::CodeGeneration(CodeGenerationData {
            owner_id,
            project_id: ProjectId::new(),
            prompt_type: "feature".to_string(),
            prompt: "add a login form".to_string(),
        });
        store.put(JobRecord::queued(job_id, &data, Utc::now())).await.unwrap();
        let message = JobMessage::new(job_id, data, Utc::now());
        Self { store, message }
    }

    fn delivery(&self, blobs: Arc<dyn BlobStore>, prefix: &'static str, files: usize, delay_ms: u64) -> CodeGenerationProcessor {
        CodeGenerationProcessor::new(
            self.store.clone(),
            blobs,
            Arc::new(InMemoryNotifier::new()),
            Arc::new(StubGenerator {
                prefix,
                files,
                delay: Duration::from_millis(delay_ms),
            }),
        )
    }

    async fn record(&self) -> JobRecord {
        self.store
            .get(self.message.id, self.message.owner_id())
            .await
            .unwrap()
            .unwrap()
    }
}

fn paths(record: &JobRecord) -> Vec<String> {
    record
        .code_generation()
        .unwrap()
        .generated_files
        .iter()
        .map(|f| f.path.clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn concurrent_delivery_finishing_second_overwrites_the_result() {
    let race = Race::new().await;
    let blobs: Arc<dyn BlobStore> = Arc::new(SlowBlobStore {
        inner: InMemoryBlobStore::default(),
        delay: Duration::from_millis(50),
    });
    // fast: files written at 10ms, completed at 60ms. slow: files at 30ms, completed at 80ms.
    let fast = race.delivery(blobs.clone(), "fast", 2, 10);
    let slow = race.delivery(blobs.clone(), "slow", 4, 30);

    let (fast_outcome, slow_outcome) = tokio::join!(fast.process(&race.message), slow.process(&race.message));
    assert!(fast_outcome.is_ok());
    assert!(slow_outcome.is_ok());

    let record = race.record().await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(paths(&record), (0..4).map(|i| format!("slow/file_{i}.rs")).collect::<Vec<_>>());
    let details = record.code_generation().unwrap();
    let archive = blobs.download(details.blob_key.as_deref().unwrap()).await.unwrap();
    assert!(!archive.is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_delivery_arriving_after_completion_is_superseded() {
    let race = Race::new().await;
    let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::default());
    // fast completes at 10ms; slow tries to write its file list at 60ms.
    let fast = race.delivery(blobs.clone(), "fast", 2, 10);
    let slow = race.delivery(blobs.clone(), "slow", 4, 60);

    let (fast_outcome, slow_outcome) = tokio::join!(fast.process(&race.message), slow.process(&race.message));
    assert!(fast_outcome.is_ok());
    assert!(matches!(
        slow_outcome,
        Err(ProcessError::Superseded {
            status: JobStatus::Completed,
            ..
        })
    ));

    let record = race.record().await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(paths(&record), vec!["fast/file_0.rs".to_string(), "fast/file_1.rs".to_string()]);
    assert!(record.code_generation().unwrap().blob_key.is_some());
}

#[tokio::test]
async fn broadcast_subscribers_hear_terminal_events() {
    let mut harness = Harness::new();
    let broadcast = Arc::new(BroadcastNotifier::new(16));
    let mut events = broadcast.subscribe();
    harness.adapters.notifier = broadcast.clone();
    let app = harness.start();
    let owner_id = OwnerId::new();

    let enqueued = app
        .service()
        .submit(JobData::CodeGeneration(CodeGenerationData {
            owner_id,
            project_id: ProjectId::new(),
            prompt_type: "page".to_string(),
            prompt: "add a pricing page".to_string(),
        }))
        .await
        .unwrap();

    let (owner, event) = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .unwrap()
        .unwrap();
    app.shutdown().await;

    assert_eq!(owner, owner_id);
    assert_eq!(event.job_id, enqueued.job_id);
    assert_eq!(event.event_type, JobEventType::Completed);
    assert!(event.download_url.is_some());
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_job() {
    let mut harness = Harness::new();
    harness.adapters.generator = Arc::new(StubGenerator {
        prefix: "src",
        files: 1,
        delay: Duration::from_millis(300),
    });
    let app = harness.start();
    let owner_id = OwnerId::new();

    let enqueued = app
        .service()
        .submit(JobData::CodeGeneration(CodeGenerationData {
            owner_id,
            project_id: ProjectId::new(),
            prompt_type: "feature".to_string(),
            prompt: "add a settings screen".to_string(),
        }))
        .await
        .unwrap();

    // Wait until the loop has picked the job up, then stop mid-generation.
    for _ in 0..300 {
        let status = app.service().status(enqueued.job_id, owner_id).await.unwrap().map(|r| r.status);
        if status == Some(JobStatus::Generating) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = app.shutdown().await;

    let record = harness.store.get(enqueued.job_id, owner_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(stats.code_generation.acknowledged, 1);
}

#[tokio::test]
async fn unconfigured_generator_fails_the_job() {
    let adapters = Adapters::in_memory(QueueSettings::default());
    let store = adapters.store.clone();
    let app = WorkerApp::start(adapters, fast_settings());
    let owner_id = OwnerId::new();

    let enqueued = app
        .service()
        .submit(JobData::CodeGeneration(CodeGenerationData {
            owner_id,
            project_id: ProjectId::new(),
            prompt_type: "feature".to_string(),
            prompt: "add a login form".to_string(),
        }))
        .await
        .unwrap();

    let mut record = None;
    for _ in 0..300 {
        record = store.get(enqueued.job_id, owner_id).await.unwrap();
        if record.as_ref().is_some_and(|r| r.status.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = app.shutdown().await;

    let record = record.unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("not configured"));
    assert_eq!(stats.code_generation.failed_jobs, 1);
}
