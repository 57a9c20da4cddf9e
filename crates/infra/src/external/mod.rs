//! External collaborators: the code generator and the deployer.
//!
//! Both are opaque, slow, and not side-effect free. Processors never retry
//! them; a failure becomes a `failed` job.

use async_trait::async_trait;

use forgegen_core::JobId;
use forgegen_jobs::{CodeGenerationData, DeploymentData, GeneratedFile};

pub mod http;

pub use http::{HttpCodeGenerator, HttpDeployer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The generator ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    #[error("code generator unreachable: {0}")]
    Transport(String),

    #[error("code generator returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeploymentError {
    /// The deployment ran and failed.
    #[error("{0}")]
    Failed(String),

    #[error("deployer unreachable: {0}")]
    Transport(String),

    #[error("deployer returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Outcome of a successful deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub url: String,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, job_id: JobId, request: &CodeGenerationData) -> Result<Vec<GeneratedFile>, GenerationError>;
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, job_id: JobId, request: &DeploymentData) -> Result<Deployment, DeploymentError>;
}

#[async_trait]
impl<T> CodeGenerator for std::sync::Arc<T>
where
    T: CodeGenerator + ?Sized,
{
    async fn generate(&self, job_id: JobId, request: &CodeGenerationData) -> Result<Vec<GeneratedFile>, GenerationError> {
        (**self).generate(job_id, request).await
    }
}

#[async_trait]
impl<T> Deployer for std::sync::Arc<T>
where
    T: Deployer + ?Sized,
{
    async fn deploy(&self, job_id: JobId, request: &DeploymentData) -> Result<Deployment, DeploymentError> {
        (**self).deploy(job_id, request).await
    }
}

/// Stand-in used when no endpoint is configured: every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait]
impl CodeGenerator for Unconfigured {
    async fn generate(&self, _job_id: JobId, _request: &CodeGenerationData) -> Result<Vec<GeneratedFile>, GenerationError> {
        tracing::warn!("code generation requested but no generator is configured");
        Err(GenerationError::Failed("code generation service is not configured".to_string()))
    }
}

#[async_trait]
impl Deployer for Unconfigured {
    async fn deploy(&self, _job_id: JobId, _request: &DeploymentData) -> Result<Deployment, DeploymentError> {
        tracing::warn!("deployment requested but no deployer is configured");
        Err(DeploymentError::Failed("deployment service is not configured".to_string()))
    }
}
