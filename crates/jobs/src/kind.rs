use serde::{Deserialize, Serialize};

use crate::status::JobStatus;

/// Job family. Each family has its own queue, worker loop and processor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    CodeGeneration,
    Deployment,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::CodeGeneration, JobType::Deployment];

    /// Wire name, as used in the message envelope `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CodeGeneration => "code-generation",
            JobType::Deployment => "deployment",
        }
    }

    /// Status the record takes once a worker has picked the job up.
    pub fn in_progress_status(&self) -> JobStatus {
        match self {
            JobType::CodeGeneration => JobStatus::Generating,
            JobType::Deployment => JobStatus::Deploying,
        }
    }

    /// Successful terminal status for this family.
    pub fn success_status(&self) -> JobStatus {
        match self {
            JobType::CodeGeneration => JobStatus::Completed,
            JobType::Deployment => JobStatus::Success,
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code-generation" => Ok(JobType::CodeGeneration),
            "deployment" => Ok(JobType::Deployment),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}
