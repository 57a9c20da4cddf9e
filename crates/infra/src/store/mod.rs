//! Job Record Store interface and adapters.
//!
//! Records are keyed by `(id, owner_id)`; a lookup with the wrong owner
//! behaves exactly like a lookup of a missing record. Adapters must give
//! read-after-write consistency per key and apply patches atomically.

use async_trait::async_trait;

use forgegen_core::{JobId, OwnerId};
use forgegen_jobs::{JobRecord, JobRecordPatch, PatchError};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobRecordStore;
pub use postgres::PostgresJobRecordStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job record not found: {id} (owner {owner_id})")]
    NotFound { id: JobId, owner_id: OwnerId },

    #[error("patch rejected: {0}")]
    Rejected(#[from] PatchError),

    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("record serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait JobRecordStore: Send + Sync {
    async fn get(&self, id: JobId, owner_id: OwnerId) -> Result<Option<JobRecord>, StoreError>;

    /// Insert or replace a whole record.
    async fn put(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Apply a partial update and return the record as stored afterwards.
    async fn update(&self, id: JobId, owner_id: OwnerId, patch: JobRecordPatch) -> Result<JobRecord, StoreError>;
}

#[async_trait]
impl<T> JobRecordStore for std::sync::Arc<T>
where
    T: JobRecordStore + ?Sized,
{
    async fn get(&self, id: JobId, owner_id: OwnerId) -> Result<Option<JobRecord>, StoreError> {
        (**self).get(id, owner_id).await
    }

    async fn put(&self, record: JobRecord) -> Result<(), StoreError> {
        (**self).put(record).await
    }

    async fn update(&self, id: JobId, owner_id: OwnerId, patch: JobRecordPatch) -> Result<JobRecord, StoreError> {
        (**self).update(id, owner_id, patch).await
    }
}
