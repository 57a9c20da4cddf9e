//! Durable Job Record and partial updates.

use chrono::{DateTime, Utc};
use forgegen_core::{JobId, OwnerId, ProjectId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kind::JobType;
use crate::message::{Environment, JobData};
use crate::status::{JobStatus, TransitionError};

/// A file produced by the code generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Entry of the generated-file list persisted on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFileEntry {
    pub path: String,
    pub size: u64,
}

impl From<&GeneratedFile> for GeneratedFileEntry {
    fn from(file: &GeneratedFile) -> Self {
        Self {
            path: file.path.clone(),
            size: file.content.len() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeGenerationDetails {
    pub prompt_type: String,
    pub prompt: String,
    #[serde(default)]
    pub generated_files: Vec<GeneratedFileEntry>,
    #[serde(default)]
    pub blob_key: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDetails {
    pub environment: Environment,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub deployed_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobDetails {
    CodeGeneration(CodeGenerationDetails),
    Deployment(DeploymentDetails),
}

impl JobDetails {
    pub fn job_type(&self) -> JobType {
        match self {
            JobDetails::CodeGeneration(_) => JobType::CodeGeneration,
            JobDetails::Deployment(_) => JobType::Deployment,
        }
    }
}

/// Job state, keyed by `(id, owner_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub project_id: ProjectId,
    pub status: JobStatus,
    pub details: JobDetails,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh `queued` record for the job a message will reference.
    pub fn queued(id: JobId, data: &JobData, now: DateTime<Utc>) -> Self {
        let details = match data {
            JobData::CodeGeneration(d) => JobDetails::CodeGeneration(CodeGenerationDetails {
                prompt_type: d.prompt_type.clone(),
                prompt: d.prompt.clone(),
                generated_files: Vec::new(),
                blob_key: None,
                download_url: None,
            }),
            JobData::Deployment(d) => JobDetails::Deployment(DeploymentDetails {
                environment: d.environment,
                config: d.config.clone(),
                deployed_url: None,
            }),
        };

        Self {
            id,
            owner_id: data.owner_id(),
            project_id: data.project_id(),
            status: JobStatus::Queued,
            details,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.details.job_type()
    }

    pub fn key(&self) -> (JobId, OwnerId) {
        (self.id, self.owner_id)
    }

    pub fn code_generation(&self) -> Option<&CodeGenerationDetails> {
        match &self.details {
            JobDetails::CodeGeneration(d) => Some(d),
            JobDetails::Deployment(_) => None,
        }
    }

    pub fn deployment(&self) -> Option<&DeploymentDetails> {
        match &self.details {
            JobDetails::Deployment(d) => Some(d),
            JobDetails::CodeGeneration(_) => None,
        }
    }

    /// Apply a partial update.
    ///
    /// Validation happens before any field is touched, so a rejected patch
    /// leaves the record unchanged.
    pub fn apply(&mut self, patch: JobRecordPatch, now: DateTime<Utc>) -> Result<(), PatchError> {
        if patch.is_empty() {
            return Ok(());
        }
        let job_type = self.job_type();

        match patch.status {
            Some(next) => self.status.check_transition(next, job_type)?,
            None if self.status.is_terminal() => {
                return Err(PatchError::Terminal { status: self.status });
            }
            None => {}
        }

        let target = patch.status.unwrap_or(self.status);
        if target == JobStatus::Failed && patch.error.as_deref().is_none_or(|e| e.trim().is_empty()) {
            return Err(PatchError::MissingError);
        }
        if target != JobStatus::Failed && patch.error.is_some() {
            return Err(PatchError::UnexpectedError { status: target });
        }

        let code_gen_fields = [
            ("generated_files", patch.generated_files.is_some()),
            ("blob_key", patch.blob_key.is_some()),
            ("download_url", patch.download_url.is_some()),
        ];
        let deployment_fields = [("deployed_url", patch.deployed_url.is_some())];
        let foreign = match job_type {
            JobType::CodeGeneration => &deployment_fields[..],
            JobType::Deployment => &code_gen_fields[..],
        };
        if let Some((field, _)) = foreign.iter().find(|(_, set)| *set) {
            return Err(PatchError::FieldNotInFamily { field: *field, job_type });
        }

        if let Some(next) = patch.status {
            self.status = next;
            self.error = patch.error;
        }
        match &mut self.details {
            JobDetails::CodeGeneration(d) => {
                if let Some(files) = patch.generated_files {
                    d.generated_files = files;
                }
                if let Some(key) = patch.blob_key {
                    d.blob_key = Some(key);
                }
                if let Some(url) = patch.download_url {
                    d.download_url = Some(url);
                }
            }
            JobDetails::Deployment(d) => {
                if let Some(url) = patch.deployed_url {
                    d.deployed_url = Some(url);
                }
            }
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Partial update of a [`JobRecord`]. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecordPatch {
    pub status: Option<JobStatus>,
    pub error: Option<String>,
    pub generated_files: Option<Vec<GeneratedFileEntry>>,
    pub blob_key: Option<String>,
    pub download_url: Option<String>,
    pub deployed_url: Option<String>,
}

impl JobRecordPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_generated_files(mut self, files: Vec<GeneratedFileEntry>) -> Self {
        self.generated_files = Some(files);
        self
    }

    pub fn with_artifact(mut self, blob_key: impl Into<String>, download_url: impl Into<String>) -> Self {
        self.blob_key = Some(blob_key.into());
        self.download_url = Some(download_url.into());
        self
    }

    pub fn with_deployed_url(mut self, url: impl Into<String>) -> Self {
        self.deployed_url = Some(url.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("record is {status}; only the same terminal status may be re-written")]
    Terminal { status: JobStatus },

    #[error("failed status requires a non-empty error")]
    MissingError,

    #[error("error may only be set together with failed (status would be {status})")]
    UnexpectedError { status: JobStatus },

    #[error("field `{field}` does not belong to {job_type} jobs")]
    FieldNotInFamily { field: &'static str, job_type: JobType },
}

impl PatchError {
    /// The record was already finished when the patch arrived.
    pub fn is_already_terminal(&self) -> bool {
        matches!(
            self,
            PatchError::Terminal { .. } | PatchError::Transition(TransitionError::LeavesTerminal { .. })
        )
    }
}
