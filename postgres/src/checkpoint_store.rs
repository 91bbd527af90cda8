//! `PostgreSQL` checkpoint store.
//!
//! Checkpoints live in one row per `(stage, document_id, partition_id)`:
//!
//! ```sql
//! CREATE TABLE lambda_checkpoints (
//!     stage        TEXT        NOT NULL,
//!     document_id  TEXT        NOT NULL,
//!     partition_id INTEGER     NOT NULL,
//!     topic        TEXT        NOT NULL,
//!     log_offset   BIGINT      NOT NULL,
//!     stage_state  JSONB       NOT NULL,
//!     updated_at   TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (stage, document_id, partition_id)
//! );
//! ```
//!
//! Saves are a guarded upsert: the row is only replaced when the stored
//! offset is not ahead of the new one. A rejected save means another instance
//! already owns the partition and surfaces as [`CheckpointError::Stale`].

use chrono::{DateTime, Utc};
use lambdas_core::{Checkpoint, CheckpointError, CheckpointKey, CheckpointStore, Offset};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

const UPSERT: &str = r"
    INSERT INTO lambda_checkpoints (
        stage, document_id, partition_id, topic, log_offset, stage_state, updated_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (stage, document_id, partition_id) DO UPDATE
    SET topic = EXCLUDED.topic,
        log_offset = EXCLUDED.log_offset,
        stage_state = EXCLUDED.stage_state,
        updated_at = EXCLUDED.updated_at
    WHERE lambda_checkpoints.log_offset <= EXCLUDED.log_offset
";

const SELECT: &str = r"
    SELECT stage, document_id, partition_id, topic, log_offset, stage_state, updated_at
    FROM lambda_checkpoints
";

/// PostgreSQL-backed [`CheckpointStore`].
///
/// # Example
///
/// ```ignore
/// use lambdas_postgres::PostgresCheckpointStore;
///
/// let store = PostgresCheckpointStore::connect("postgres://localhost/lambdas", 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Create a store on an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CheckpointError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Failed to connect: {e}")))?;

        tracing::info!(max_connections, "Connected checkpoint store");
        Ok(Self::new(pool))
    }

    /// Create the checkpoint table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), CheckpointError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Every checkpoint of `stage`, ordered by document and partition.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the query fails or a row is unreadable.
    pub async fn list(&self, stage: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let query = format!("{SELECT} WHERE stage = $1 ORDER BY document_id, partition_id");
        let rows = sqlx::query(&query)
            .bind(stage)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn load_checkpoint(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointError> {
        let started = Instant::now();
        let query = format!("{SELECT} WHERE stage = $1 AND document_id = $2 AND partition_id = $3");
        let row = sqlx::query(&query)
            .bind(&key.stage)
            .bind(&key.document_id)
            .bind(key.partition)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        record_query("load", started);
        row.as_ref().map(row_to_checkpoint).transpose()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let started = Instant::now();
        let result = sqlx::query(UPSERT)
            .bind(&checkpoint.stage)
            .bind(&checkpoint.document_id)
            .bind(checkpoint.partition)
            .bind(&checkpoint.topic)
            .bind(to_db_offset(checkpoint.offset)?)
            .bind(&checkpoint.stage_state)
            .bind(checkpoint.updated_at)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        record_query("save", started);

        if result.rows_affected() > 0 {
            tracing::trace!(key = %checkpoint.key(), offset = checkpoint.offset, "Checkpoint stored");
            return Ok(());
        }

        // The guard rejected the write: report what is stored instead.
        let key = checkpoint.key();
        let stored = self
            .load_checkpoint(&key)
            .await?
            .map_or(checkpoint.offset, |stored| stored.offset);
        metrics::counter!("lambdas.postgres.stale_rejections", "stage" => checkpoint.stage.clone())
            .increment(1);
        Err(CheckpointError::Stale {
            key,
            stored,
            attempted: checkpoint.offset,
        })
    }

    async fn clear_checkpoint(&self, key: &CheckpointKey) -> Result<(), CheckpointError> {
        sqlx::query(
            r"
            DELETE FROM lambda_checkpoints
            WHERE stage = $1 AND document_id = $2 AND partition_id = $3
            ",
        )
        .bind(&key.stage)
        .bind(&key.document_id)
        .bind(key.partition)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::info!(key = %key, "Checkpoint cleared");
        Ok(())
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    fn load(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move { self.load_checkpoint(&key).await })
    }

    fn save(
        &self,
        checkpoint: &Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + '_>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move { self.save_checkpoint(&checkpoint).await })
    }

    fn clear(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move { self.clear_checkpoint(&key).await })
    }
}

fn storage_error(error: sqlx::Error) -> CheckpointError {
    CheckpointError::Storage(error.to_string())
}

fn record_query(operation: &'static str, started: Instant) {
    metrics::histogram!("lambdas.postgres.query_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

fn to_db_offset(offset: Offset) -> Result<i64, CheckpointError> {
    i64::try_from(offset)
        .map_err(|_| CheckpointError::Serialization(format!("Offset {offset} exceeds BIGINT")))
}

fn from_db_offset(offset: i64) -> Result<Offset, CheckpointError> {
    Offset::try_from(offset)
        .map_err(|_| CheckpointError::Serialization(format!("Negative stored offset {offset}")))
}

fn row_to_checkpoint(row: &PgRow) -> Result<Checkpoint, CheckpointError> {
    let offset: i64 = row.try_get("log_offset").map_err(storage_error)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(storage_error)?;

    Ok(Checkpoint {
        stage: row.try_get("stage").map_err(storage_error)?,
        document_id: row.try_get("document_id").map_err(storage_error)?,
        topic: row.try_get("topic").map_err(storage_error)?,
        partition: row.try_get("partition_id").map_err(storage_error)?,
        offset: from_db_offset(offset)?,
        stage_state: row.try_get("stage_state").map_err(storage_error)?,
        updated_at,
    })
}
