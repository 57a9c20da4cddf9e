//! Job Message envelope and its wire codec.
//!
//! Wire format (UTF-8 JSON):
//!
//! ```json
//! {"id": "<uuid>", "type": "code-generation", "data": {...}, "enqueuedAt": "<RFC3339>"}
//! ```
//!
//! `data` is decoded according to `type`, so a message can never carry a
//! payload of the other family.

use chrono::{DateTime, Utc};
use forgegen_core::{DomainError, DomainResult, JobId, OwnerId, ProjectId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kind::JobType;

/// Target environment of a deployment job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl core::fmt::Display for Environment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeGenerationData {
    pub owner_id: OwnerId,
    pub project_id: ProjectId,
    pub prompt_type: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentData {
    pub owner_id: OwnerId,
    pub project_id: ProjectId,
    pub environment: Environment,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Job-type specific payload. The variant *is* the job type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobData {
    CodeGeneration(CodeGenerationData),
    Deployment(DeploymentData),
}

impl JobData {
    pub fn job_type(&self) -> JobType {
        match self {
            JobData::CodeGeneration(_) => JobType::CodeGeneration,
            JobData::Deployment(_) => JobType::Deployment,
        }
    }

    pub fn owner_id(&self) -> OwnerId {
        match self {
            JobData::CodeGeneration(d) => d.owner_id,
            JobData::Deployment(d) => d.owner_id,
        }
    }

    pub fn project_id(&self) -> ProjectId {
        match self {
            JobData::CodeGeneration(d) => d.project_id,
            JobData::Deployment(d) => d.project_id,
        }
    }

    /// Payload checks serde cannot express.
    pub fn validate(&self) -> DomainResult<()> {
        if let JobData::CodeGeneration(d) = self {
            if d.prompt.trim().is_empty() {
                return Err(DomainError::validation("prompt must not be empty"));
            }
        }
        Ok(())
    }
}

/// A queue payload referencing a Job Record by id.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMessage {
    pub id: JobId,
    pub data: JobData,
    /// Informational only; never used for ordering.
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown job type: {0}")]
    UnknownType(String),

    #[error("invalid job id: {0}")]
    InvalidId(String),

    #[error("invalid {job_type} payload: {reason}")]
    InvalidData { job_type: JobType, reason: String },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    id: String,
    #[serde(rename = "type")]
    job_type: String,
    data: serde_json::Value,
    enqueued_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(id: JobId, data: JobData, enqueued_at: DateTime<Utc>) -> Self {
        Self { id, data, enqueued_at }
    }

    pub fn job_type(&self) -> JobType {
        self.data.job_type()
    }

    pub fn owner_id(&self) -> OwnerId {
        self.data.owner_id()
    }

    pub fn encode(&self) -> Result<String, EncodeError> {
        let data = match &self.data {
            JobData::CodeGeneration(d) => serde_json::to_value(d)?,
            JobData::Deployment(d) => serde_json::to_value(d)?,
        };
        let wire = WireMessage {
            id: self.id.to_string(),
            job_type: self.job_type().as_str().to_string(),
            data,
            enqueued_at: self.enqueued_at,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn decode(body: &str) -> Result<Self, DecodeError> {
        let wire: WireMessage = serde_json::from_str(body)?;

        let job_type: JobType = wire.job_type.parse().map_err(|_| DecodeError::UnknownType(wire.job_type.clone()))?;
        let id: JobId = wire.id.parse().map_err(|e: DomainError| DecodeError::InvalidId(e.to_string()))?;

        let invalid = |e: serde_json::Error| DecodeError::InvalidData { job_type, reason: e.to_string() };
        let data = match job_type {
            JobType::CodeGeneration => JobData::CodeGeneration(serde_json::from_value(wire.data).map_err(invalid)?),
            JobType::Deployment => JobData::Deployment(serde_json::from_value(wire.data).map_err(invalid)?),
        };
        data.validate()
            .map_err(|e| DecodeError::InvalidData { job_type, reason: e.to_string() })?;

        Ok(Self { id, data, enqueued_at: wire.enqueued_at })
    }
}
