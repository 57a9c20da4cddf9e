//! `forgegen-jobs`: the asynchronous job model.
//!
//! Pure types shared by the producer, the worker loops and the processors:
//!
//! - [`JobType`]: the two job families (code generation, deployment)
//! - [`JobMessage`]: the queue envelope and its wire codec
//! - [`JobStatus`]: the per-family state machine
//! - [`JobRecord`] / [`JobRecordPatch`]: the durable record and partial updates
//! - [`JobEvent`]: state-transition notifications
//!
//! This crate performs no IO.

pub mod event;
pub mod kind;
pub mod message;
pub mod record;
pub mod status;

pub use event::{JobEvent, JobEventType};
pub use kind::JobType;
pub use message::{
    CodeGenerationData, DecodeError, DeploymentData, EncodeError, Environment, JobData, JobMessage,
};
pub use record::{
    CodeGenerationDetails, DeploymentDetails, GeneratedFile, GeneratedFileEntry, JobDetails,
    JobRecord, JobRecordPatch, PatchError,
};
pub use status::{JobStatus, TransitionError};
