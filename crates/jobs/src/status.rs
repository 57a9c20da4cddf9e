//! Job status state machine.
//!
//! Both families share the same shape:
//!
//! ```text
//! queued ──► generating | deploying ──► completed | success
//!                    │      ▲  (redelivery)
//!                    │      └──┘
//!                    └──────────────────► failed
//! ```
//!
//! Terminal states are absorbing. A terminal state may only be re-written with
//! itself (last writer wins on a redelivered job that finished twice).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kind::JobType;

/// Status of a job record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record created, message enqueued, not yet picked up.
    Queued,
    /// Code generation in progress.
    Generating,
    /// Deployment in progress.
    Deploying,
    /// Code generation finished; artifacts uploaded.
    Completed,
    /// Deployment finished.
    Success,
    /// Processing failed; `error` carries the reason.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("status may not return to queued (from {from})")]
    ReturnToQueued { from: JobStatus },

    #[error("{from} is terminal; cannot move to {to}")]
    LeavesTerminal { from: JobStatus, to: JobStatus },

    #[error("status {status} does not belong to {job_type} jobs")]
    WrongFamily { status: JobStatus, job_type: JobType },

    #[error("cannot move from {from} to {to} without processing")]
    Skipped { from: JobStatus, to: JobStatus },
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Generating => "generating",
            JobStatus::Deploying => "deploying",
            JobStatus::Completed => "completed",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Success | JobStatus::Failed)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, JobStatus::Generating | JobStatus::Deploying)
    }

    /// The family a status is specific to. `queued` and `failed` are shared.
    pub fn family(&self) -> Option<JobType> {
        match self {
            JobStatus::Generating | JobStatus::Completed => Some(JobType::CodeGeneration),
            JobStatus::Deploying | JobStatus::Success => Some(JobType::Deployment),
            JobStatus::Queued | JobStatus::Failed => None,
        }
    }

    /// Validate `self -> next` for a record of the given family.
    pub fn check_transition(self, next: JobStatus, job_type: JobType) -> Result<(), TransitionError> {
        for status in [self, next] {
            if status.family().is_some_and(|f| f != job_type) {
                return Err(TransitionError::WrongFamily { status, job_type });
            }
        }

        if next == JobStatus::Queued {
            return Err(TransitionError::ReturnToQueued { from: self });
        }

        if self.is_terminal() {
            return if self == next {
                Ok(())
            } else {
                Err(TransitionError::LeavesTerminal { from: self, to: next })
            };
        }

        match (self, next) {
            (JobStatus::Queued, n) if n.is_in_progress() => Ok(()),
            (JobStatus::Queued, n) => Err(TransitionError::Skipped { from: self, to: n }),
            // in progress: stay (redelivery) or finish
            _ => Ok(()),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
