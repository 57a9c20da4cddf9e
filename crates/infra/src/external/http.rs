//! HTTP clients for the generator and deployer services (JSON over POST).
//!
//! Generator: `POST <url>` with `{jobId, ownerId, projectId, promptType, prompt}`,
//! answers `{files: [{path, content}]}`.
//!
//! Deployer: `POST <url>` with `{jobId, ownerId, projectId, environment, config}`,
//! answers `{url}` on success or `{error}` with a non-2xx status.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use forgegen_core::{JobId, OwnerId, ProjectId};
use forgegen_jobs::{CodeGenerationData, DeploymentData, Environment, GeneratedFile};

use super::{CodeGenerator, Deployer, Deployment, DeploymentError, GenerationError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    job_id: JobId,
    owner_id: OwnerId,
    project_id: ProjectId,
    prompt_type: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    files: Vec<GeneratedFile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeployRequest<'a> {
    job_id: JobId,
    owner_id: OwnerId,
    project_id: ProjectId,
    environment: Environment,
    config: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DeployResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct HttpCodeGenerator {
    client: reqwest::Client,
    url: String,
}

impl HttpCodeGenerator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl CodeGenerator for HttpCodeGenerator {
    #[instrument(skip(self, request), fields(job_id = %job_id, url = %self.url), err)]
    async fn generate(&self, job_id: JobId, request: &CodeGenerationData) -> Result<Vec<GeneratedFile>, GenerationError> {
        let body = GenerateRequest {
            job_id,
            owner_id: request.owner_id,
            project_id: request.project_id,
            prompt_type: &request.prompt_type,
            prompt: &request.prompt,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Rejected { status, body });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Failed(format!("invalid generator response: {e}")))?;
        Ok(parsed.files)
    }
}

#[derive(Debug, Clone)]
pub struct HttpDeployer {
    client: reqwest::Client,
    url: String,
}

impl HttpDeployer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeploymentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeploymentError::Transport(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Deployer for HttpDeployer {
    #[instrument(skip(self, request), fields(job_id = %job_id, environment = %request.environment, url = %self.url), err)]
    async fn deploy(&self, job_id: JobId, request: &DeploymentData) -> Result<Deployment, DeploymentError> {
        let body = DeployRequest {
            job_id,
            owner_id: request.owner_id,
            project_id: request.project_id,
            environment: request.environment,
            config: &request.config,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeploymentError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            // Prefer the service's own error message when it sends one.
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(ErrorBody { error }) if !error.trim().is_empty() => DeploymentError::Failed(error),
                _ => DeploymentError::Rejected { status, body: text },
            });
        }

        let parsed: DeployResponse = response
            .json()
            .await
            .map_err(|e| DeploymentError::Failed(format!("invalid deployer response: {e}")))?;
        Ok(Deployment { url: parsed.url })
    }
}
