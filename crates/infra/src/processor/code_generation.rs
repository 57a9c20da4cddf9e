//! Code-generation processor.
//!
//! `queued → generating → completed | failed`. Subscribers hear only about
//! the terminal state.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use forgegen_core::{JobId, OwnerId};
use forgegen_jobs::{
    CodeGenerationData, GeneratedFileEntry, JobData, JobMessage, JobRecordPatch, JobStatus, JobType,
};

use super::{JobProcessor, ProcessError, Started, announce, fail, persist, start};
use crate::archive;
use crate::blob::BlobStore;
use crate::external::CodeGenerator;
use crate::notify::Notifier;
use crate::store::JobRecordStore;

pub struct CodeGenerationProcessor {
    store: Arc<dyn JobRecordStore>,
    blobs: Arc<dyn BlobStore>,
    notifier: Arc<dyn Notifier>,
    generator: Arc<dyn CodeGenerator>,
}

/// Why the work itself failed. Becomes the record's `error`.
enum WorkError {
    Failed(String),
    Process(ProcessError),
}

impl CodeGenerationProcessor {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
        generator: Arc<dyn CodeGenerator>,
    ) -> Self {
        Self {
            store,
            blobs,
            notifier,
            generator,
        }
    }

    /// Generate, persist the file list, package and upload. Returns the terminal patch.
    async fn run(&self, job_id: JobId, data: &CodeGenerationData) -> Result<JobRecordPatch, WorkError> {
        let files = self
            .generator
            .generate(job_id, data)
            .await
            .map_err(|e| WorkError::Failed(e.to_string()))?;
        let entries: Vec<GeneratedFileEntry> = files.iter().map(GeneratedFileEntry::from).collect();
        debug!(job_id = %job_id, files = entries.len(), "code generated");

        persist(
            &*self.store,
            job_id,
            data.owner_id,
            JobRecordPatch::default().with_generated_files(entries.clone()),
        )
        .await
        .map_err(WorkError::Process)?;

        let bytes = archive::pack(&files).map_err(|e| WorkError::Failed(e.to_string()))?;
        let key = archive::artifact_key(data.owner_id, data.project_id, job_id);
        let stored = self
            .blobs
            .upload(&key, bytes, archive::CONTENT_TYPE)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    WorkError::Process(ProcessError::Blob(e))
                } else {
                    WorkError::Failed(format!("artifact upload failed: {e}"))
                }
            })?;
        debug!(job_id = %job_id, key = %stored.key, size = stored.size, "artifact uploaded");

        Ok(JobRecordPatch::status(JobStatus::Completed)
            .with_generated_files(entries)
            .with_artifact(stored.key, stored.url))
    }

    async fn fail(&self, job_id: JobId, owner_id: OwnerId, error: String) -> ProcessError {
        fail(&*self.store, &*self.notifier, job_id, owner_id, error).await
    }
}

#[async_trait]
impl JobProcessor for CodeGenerationProcessor {
    fn job_type(&self) -> JobType {
        JobType::CodeGeneration
    }

    #[instrument(
        skip(self, message),
        fields(job_id = %message.id, owner_id = %message.owner_id(), job_type = %message.job_type())
    )]
    async fn process(&self, message: &JobMessage) -> Result<(), ProcessError> {
        let JobData::CodeGeneration(data) = &message.data else {
            return Err(ProcessError::WrongJobType {
                expected: JobType::CodeGeneration,
                actual: message.job_type(),
            });
        };
        let (job_id, owner_id) = (message.id, data.owner_id);

        match start(&*self.store, message).await? {
            Started::Running(_) => {}
            Started::AlreadyFinished(status) => {
                info!(%status, "job already finished; skipping redelivery");
                return Ok(());
            }
        }

        let patch = match self.run(job_id, data).await {
            Ok(patch) => patch,
            Err(WorkError::Process(e)) => return Err(e),
            Err(WorkError::Failed(error)) => {
                warn!(error = %error, "code generation failed");
                return Err(self.fail(job_id, owner_id, error).await);
            }
        };

        let record = persist(&*self.store, job_id, owner_id, patch).await?;
        info!(status = %record.status, "code generation completed");
        announce(&*self.notifier, &record).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use forgegen_core::ProjectId;
    use forgegen_jobs::{GeneratedFile, JobEventType};

    use crate::blob::{BlobError, InMemoryBlobStore, StoredBlob};
    use crate::external::GenerationError;
    use crate::notify::InMemoryNotifier;
    use crate::processor::Disposition;
    use crate::processor::testing::{BrokenNotifier, DownStore, ids, seed};
    use crate::store::InMemoryJobRecordStore;

    struct FixedGenerator(Result<Vec<GeneratedFile>, GenerationError>);

    #[async_trait]
    impl CodeGenerator for FixedGenerator {
        async fn generate(&self, _: JobId, _: &CodeGenerationData) -> Result<Vec<GeneratedFile>, GenerationError> {
            self.0.clone()
        }
    }

    fn three_files() -> Vec<GeneratedFile> {
        ["src/login.rs", "src/lib.rs", "templates/login.html"]
            .into_iter()
            .map(|path| GeneratedFile {
                path: path.to_string(),
                content: format!("// {path}"),
            })
            .collect()
    }

    fn message(owner_id: OwnerId, project_id: ProjectId) -> JobMessage {
        JobMessage::new(
            JobId::new(),
            JobData::CodeGeneration(CodeGenerationData {
                owner_id,
                project_id,
                prompt_type: "feature".to_string(),
                prompt: "add a login form".to_string(),
            }),
            Utc::now(),
        )
    }

    struct Fixture {
        store: Arc<InMemoryJobRecordStore>,
        blobs: Arc<InMemoryBlobStore>,
        notifier: Arc<InMemoryNotifier>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryJobRecordStore::new()),
                blobs: Arc::new(InMemoryBlobStore::default()),
                notifier: Arc::new(InMemoryNotifier::new()),
            }
        }

        fn processor(&self, result: Result<Vec<GeneratedFile>, GenerationError>) -> CodeGenerationProcessor {
            CodeGenerationProcessor::new(
                self.store.clone(),
                self.blobs.clone(),
                self.notifier.clone(),
                Arc::new(FixedGenerator(result)),
            )
        }
    }

    #[tokio::test]
    async fn success_persists_artifacts_then_notifies() {
        let fx = Fixture::new();
        let (_, owner, project) = ids();
        let msg = message(owner, project);
        seed(&fx.store, &msg).await;

        fx.processor(Ok(three_files())).process(&msg).await.unwrap();

        let record = fx.store.get(msg.id, owner).await.unwrap().unwrap();
        let details = record.code_generation().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(details.generated_files.len(), 3);
        let key = details.blob_key.clone().unwrap();
        assert_eq!(key, archive::artifact_key(owner, project, msg.id));
        assert_eq!(fx.blobs.keys(), vec![key.clone()]);
        assert_eq!(fx.blobs.content_type(&key).as_deref(), Some("application/gzip"));

        let events = fx.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.event_type, JobEventType::Completed);
        assert_eq!(events[0].1.download_url, details.download_url);
    }

    #[tokio::test]
    async fn generator_failure_marks_failed() {
        let fx = Fixture::new();
        let (_, owner, project) = ids();
        let msg = message(owner, project);
        seed(&fx.store, &msg).await;

        let err = fx
            .processor(Err(GenerationError::Failed("model overloaded".to_string())))
            .process(&msg)
            .await
            .unwrap_err();
        assert!(matches!(&err, ProcessError::JobFailed { error, .. } if error == "model overloaded"));
        assert_eq!(err.disposition(), Disposition::Acknowledge);

        let record = fx.store.get(msg.id, owner).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("model overloaded"));
        assert_eq!(fx.notifier.event_types_for(msg.id), vec![JobEventType::Failed]);
        assert!(fx.blobs.keys().is_empty());
    }

    #[tokio::test]
    async fn invalid_generated_path_fails_the_job() {
        let fx = Fixture::new();
        let (_, owner, project) = ids();
        let msg = message(owner, project);
        seed(&fx.store, &msg).await;

        let files = vec![GeneratedFile {
            path: "../../etc/passwd".to_string(),
            content: "x".to_string(),
        }];
        let err = fx.processor(Ok(files)).process(&msg).await.unwrap_err();
        assert!(matches!(err, ProcessError::JobFailed { .. }));

        let record = fx.store.get(msg.id, owner).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("invalid file path"));
    }

    #[tokio::test]
    async fn redelivery_after_completion_keeps_artifacts() {
        let fx = Fixture::new();
        let (_, owner, project) = ids();
        let msg = message(owner, project);
        seed(&fx.store, &msg).await;

        fx.processor(Ok(three_files())).process(&msg).await.unwrap();
        let completed = fx.store.get(msg.id, owner).await.unwrap().unwrap();

        // A stale retry whose generation would now fail must not touch the record.
        fx.processor(Err(GenerationError::Failed("late".to_string())))
            .process(&msg)
            .await
            .unwrap();

        let after = fx.store.get(msg.id, owner).await.unwrap().unwrap();
        assert_eq!(after, completed);
        assert_eq!(fx.notifier.event_types_for(msg.id), vec![JobEventType::Completed]);
    }

    #[tokio::test]
    async fn missing_record_is_orphaned() {
        let fx = Fixture::new();
        let (_, owner, project) = ids();
        let msg = message(owner, project);

        let err = fx.processor(Ok(three_files())).process(&msg).await.unwrap_err();
        assert!(matches!(err, ProcessError::Orphaned { .. }));
        assert_eq!(err.disposition(), Disposition::Acknowledge);
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn store_outage_is_retried() {
        let fx = Fixture::new();
        let down = Arc::new(DownStore::default());
        let (_, owner, project) = ids();
        let msg = message(owner, project);
        seed(&down.inner, &msg).await;

        let processor = CodeGenerationProcessor::new(
            down.clone(),
            fx.blobs.clone(),
            fx.notifier.clone(),
            Arc::new(FixedGenerator(Ok(three_files()))),
        );
        let err = processor.process(&msg).await.unwrap_err();
        assert_eq!(err.disposition(), Disposition::Retry);
        assert!(fx.notifier.events().is_empty());
    }

    /// Blob store whose uploads always fail with the given error kind.
    struct FailingBlobStore(Option<std::io::ErrorKind>);

    #[async_trait]
    impl BlobStore for FailingBlobStore {
        async fn upload(&self, key: &str, _: Vec<u8>, _: &str) -> Result<StoredBlob, BlobError> {
            Err(match self.0 {
                Some(kind) => BlobError::Io(std::io::Error::new(kind, "blob store unreachable")),
                None => BlobError::InvalidKey(key.to_string()),
            })
        }

        async fn download(&self, key: &str) -> Result<Vec<u8>, BlobError> {
            Err(BlobError::NotFound(key.to_string()))
        }
    }

    fn with_blobs(fx: &Fixture, blobs: FailingBlobStore) -> CodeGenerationProcessor {
        CodeGenerationProcessor::new(
            fx.store.clone(),
            Arc::new(blobs),
            fx.notifier.clone(),
            Arc::new(FixedGenerator(Ok(three_files()))),
        )
    }

    #[tokio::test]
    async fn blob_outage_is_retried_without_failing_the_job() {
        let fx = Fixture::new();
        let (_, owner, project) = ids();
        let msg = message(owner, project);
        seed(&fx.store, &msg).await;

        let err = with_blobs(&fx, FailingBlobStore(Some(std::io::ErrorKind::ConnectionRefused)))
            .process(&msg)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Blob(_)));
        assert_eq!(err.disposition(), Disposition::Retry);

        let record = fx.store.get(msg.id, owner).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Generating);
        assert!(record.error.is_none());
        assert!(fx.notifier.events().is_empty());

        // The redelivery finishes the job once the store is back.
        fx.processor(Ok(three_files())).process(&msg).await.unwrap();
        let record = fx.store.get(msg.id, owner).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(fx.notifier.event_types_for(msg.id), vec![JobEventType::Completed]);
    }

    #[tokio::test]
    async fn rejected_upload_fails_the_job() {
        let fx = Fixture::new();
        let (_, owner, project) = ids();
        let msg = message(owner, project);
        seed(&fx.store, &msg).await;

        let err = with_blobs(&fx, FailingBlobStore(None)).process(&msg).await.unwrap_err();
        assert!(matches!(err, ProcessError::JobFailed { .. }));
        assert_eq!(err.disposition(), Disposition::Acknowledge);

        let record = fx.store.get(msg.id, owner).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().starts_with("artifact upload failed"));
    }

    #[tokio::test]
    async fn notifier_failure_does_not_fail_the_job() {
        let fx = Fixture::new();
        let (_, owner, project) = ids();
        let msg = message(owner, project);
        seed(&fx.store, &msg).await;

        let processor = CodeGenerationProcessor::new(
            fx.store.clone(),
            fx.blobs.clone(),
            Arc::new(BrokenNotifier),
            Arc::new(FixedGenerator(Ok(three_files()))),
        );
        processor.process(&msg).await.unwrap();

        let record = fx.store.get(msg.id, owner).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn deployment_message_is_rejected() {
        let fx = Fixture::new();
        let msg = JobMessage::new(
            JobId::new(),
            JobData::Deployment(forgegen_jobs::DeploymentData {
                owner_id: OwnerId::new(),
                project_id: ProjectId::new(),
                environment: forgegen_jobs::Environment::Staging,
                config: serde_json::json!({}),
            }),
            Utc::now(),
        );
        let err = fx.processor(Ok(three_files())).process(&msg).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessError::WrongJobType {
                expected: JobType::CodeGeneration,
                actual: JobType::Deployment
            }
        ));
    }
}
