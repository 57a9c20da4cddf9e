//! Infrastructure layer: queues, record/blob stores, notifier, external
//! services, and the job pipeline built on them (producer, processors,
//! worker loops).

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod archive;
pub mod blob;
pub mod config;
pub mod external;
pub mod notify;
pub mod processor;
pub mod producer;
pub mod queue;
pub mod service;
pub mod store;
pub mod worker;

pub use config::{Config, ConfigError};
pub use producer::{EnqueueError, Enqueued, Producer};
pub use service::JobService;
pub use worker::{WorkerHandle, WorkerLoop, WorkerSettings, WorkerStats};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
