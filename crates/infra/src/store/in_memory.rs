use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use forgegen_core::{JobId, OwnerId};
use forgegen_jobs::{JobRecord, JobRecordPatch};

use super::{JobRecordStore, StoreError};

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRecordStore {
    records: RwLock<HashMap<(JobId, OwnerId), JobRecord>>,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored record, in no particular order.
    pub fn all(&self) -> Vec<JobRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobRecordStore {
    async fn get(&self, id: JobId, owner_id: OwnerId) -> Result<Option<JobRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&(id, owner_id)).cloned())
    }

    async fn put(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(record.key(), record);
        Ok(())
    }

    async fn update(&self, id: JobId, owner_id: OwnerId, patch: JobRecordPatch) -> Result<JobRecord, StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(&(id, owner_id))
            .ok_or(StoreError::NotFound { id, owner_id })?;
        record.apply(patch, Utc::now())?;
        Ok(record.clone())
    }
}
