//! Postgres snapshot registry

use crate::registry::{SnapshotRecord, SnapshotRegistry};
use crate::{SnapshotStoreError, SnapshotStoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS workspace_snapshot (
    workspace_id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    partition INTEGER NOT NULL,
    "offset" BIGINT NOT NULL,
    "timestamp" TIMESTAMPTZ NOT NULL,
    num_partitions INTEGER NOT NULL
)"#;

// The WHERE clause on the conflict branch keeps the offset monotonic.
const UPSERT: &str = r#"
INSERT INTO workspace_snapshot (workspace_id, path, partition, "offset", "timestamp", num_partitions)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (workspace_id) DO UPDATE SET
    path = EXCLUDED.path,
    partition = EXCLUDED.partition,
    "offset" = EXCLUDED."offset",
    "timestamp" = EXCLUDED."timestamp",
    num_partitions = EXCLUDED.num_partitions
WHERE workspace_snapshot."offset" <= EXCLUDED."offset""#;

const SELECT_COLUMNS: &str = r#"SELECT workspace_id, path, partition, "offset", "timestamp", num_partitions FROM workspace_snapshot"#;

fn registry_error(e: sqlx::Error) -> SnapshotStoreError {
    SnapshotStoreError::RegistryError(e.to_string())
}

/// Registry stored in the `workspace_snapshot` table
#[derive(Debug, Clone)]
pub struct PostgresSnapshotRegistry {
    pool: PgPool,
}

impl PostgresSnapshotRegistry {
    /// Connect and make sure the table exists
    pub async fn connect(database_url: &str) -> SnapshotStoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(registry_error)?;
        sqlx::query(CREATE_TABLE).execute(&pool).await.map_err(registry_error)?;
        info!("Connected snapshot registry");
        Ok(Self { pool })
    }

    /// Registry over an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(row: &sqlx::postgres::PgRow) -> SnapshotStoreResult<SnapshotRecord> {
        Ok(SnapshotRecord {
            workspace_id: row.try_get("workspace_id").map_err(registry_error)?,
            path: row.try_get("path").map_err(registry_error)?,
            partition: row.try_get("partition").map_err(registry_error)?,
            offset: row.try_get("offset").map_err(registry_error)?,
            timestamp: row.try_get::<DateTime<Utc>, _>("timestamp").map_err(registry_error)?,
            num_partitions: row.try_get("num_partitions").map_err(registry_error)?,
        })
    }
}

#[async_trait]
impl SnapshotRegistry for PostgresSnapshotRegistry {
    async fn record(&self, record: SnapshotRecord) -> SnapshotStoreResult<bool> {
        let result = sqlx::query(UPSERT)
            .bind(&record.workspace_id)
            .bind(&record.path)
            .bind(record.partition)
            .bind(record.offset)
            .bind(record.timestamp)
            .bind(record.num_partitions)
            .execute(&self.pool)
            .await
            .map_err(registry_error)?;
        let applied = result.rows_affected() > 0;
        debug!(workspace_id = %record.workspace_id, offset = record.offset, applied, "Recorded snapshot");
        Ok(applied)
    }

    async fn latest(&self, workspace_id: &str) -> SnapshotStoreResult<Option<SnapshotRecord>> {
        let row = sqlx::query(&format!("{} WHERE workspace_id = $1", SELECT_COLUMNS))
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(registry_error)?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn all(&self) -> SnapshotStoreResult<Vec<SnapshotRecord>> {
        let rows = sqlx::query(&format!("{} ORDER BY workspace_id", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(registry_error)?;
        rows.iter().map(Self::decode).collect()
    }
}
