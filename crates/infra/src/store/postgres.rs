//! Postgres-backed Job Record Store.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE job_records (
//!     id         UUID        NOT NULL,
//!     owner_id   UUID        NOT NULL,
//!     job_type   TEXT        NOT NULL,
//!     status     TEXT        NOT NULL,
//!     body       JSONB       NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (id, owner_id)
//! );
//! ```
//!
//! The full record lives in `body`; `job_type`, `status` and the timestamps
//! are denormalised for querying. Patches are applied in a transaction under
//! `SELECT ... FOR UPDATE`, so concurrent writers to one key serialise and the
//! last committed write wins.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | `Io`, `PoolTimedOut`, `PoolClosed`, `Tls`, `Protocol` | `Unavailable` |
//! | `Database` (any code) | `Unavailable` |
//! | `ColumnDecode`, `Decode`, `TypeNotFound` | `Serialization` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use forgegen_core::{JobId, OwnerId};
use forgegen_jobs::{JobRecord, JobRecordPatch};

use super::{JobRecordStore, StoreError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_records (
    id         UUID        NOT NULL,
    owner_id   UUID        NOT NULL,
    job_type   TEXT        NOT NULL,
    status     TEXT        NOT NULL,
    body       JSONB       NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (id, owner_id)
)
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresJobRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect with a small default pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `job_records` table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobRecordStore for PostgresJobRecordStore {
    #[instrument(skip(self), fields(job_id = %id, owner_id = %owner_id), err)]
    async fn get(&self, id: JobId, owner_id: OwnerId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT body FROM job_records WHERE id = $1 AND owner_id = $2")
            .bind(id.as_uuid())
            .bind(owner_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_body(&row)).transpose()
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, owner_id = %record.owner_id), err)]
    async fn put(&self, record: JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_records (id, owner_id, job_type, status, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id, owner_id) DO UPDATE SET
                job_type = EXCLUDED.job_type,
                status = EXCLUDED.status,
                body = EXCLUDED.body,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.owner_id.as_uuid())
        .bind(record.job_type().as_str())
        .bind(record.status.as_str())
        .bind(Json(&record))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put", e))?;
        Ok(())
    }

    #[instrument(skip(self, patch), fields(job_id = %id, owner_id = %owner_id, status = ?patch.status), err)]
    async fn update(&self, id: JobId, owner_id: OwnerId, patch: JobRecordPatch) -> Result<JobRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("update", e))?;

        let row = sqlx::query("SELECT body FROM job_records WHERE id = $1 AND owner_id = $2 FOR UPDATE")
            .bind(id.as_uuid())
            .bind(owner_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;

        let Some(row) = row else {
            return Err(StoreError::NotFound { id, owner_id });
        };
        let mut record = decode_body(&row)?;
        // Dropping `tx` on the error path rolls back and releases the row lock.
        record.apply(patch, Utc::now())?;

        sqlx::query("UPDATE job_records SET status = $3, body = $4, updated_at = $5 WHERE id = $1 AND owner_id = $2")
            .bind(id.as_uuid())
            .bind(owner_id.as_uuid())
            .bind(record.status.as_str())
            .bind(Json(&record))
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("update", e))?;
        Ok(record)
    }
}

fn decode_body(row: &sqlx::postgres::PgRow) -> Result<JobRecord, StoreError> {
    row.try_get::<Json<JobRecord>, _>("body")
        .map(|Json(record)| record)
        .map_err(|e| StoreError::Serialization(format!("failed to decode job record: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            StoreError::Unavailable(format!("database error in {operation} ({code}): {}", db_err.message()))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}
