//! Checkpoint persistence
//!
//! Per-shard progress markers for the stream consumer. Single writer per
//! shard; written after both projection targets have returned for a batch.
//! Losing a checkpoint is safe — re-delivery is covered by the idempotent
//! handlers — so the store favors simplicity over coordination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;

use super::ShardId;

/// Errors from the checkpoint store
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint store failure: {0}")]
    Storage(String),
}

/// Durable per-shard sequence markers.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last checkpointed sequence for a shard, if any.
    async fn load(&self, shard_id: ShardId) -> Result<Option<i64>, CheckpointError>;

    /// Persist the sequence of the last processed record for a shard.
    async fn save(&self, shard_id: ShardId, sequence: i64) -> Result<(), CheckpointError>;

    /// Drop every checkpoint. Used when rebuilding projections from the
    /// trim horizon.
    async fn reset_all(&self) -> Result<(), CheckpointError>;
}

/// Checkpoints in a Postgres table (`stream_checkpoints`).
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, shard_id: ShardId) -> Result<Option<i64>, CheckpointError> {
        let sequence: Option<i64> = sqlx::query_scalar(
            "SELECT last_seq FROM stream_checkpoints WHERE shard_id = $1",
        )
        .bind(shard_id.0 as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        Ok(sequence)
    }

    async fn save(&self, shard_id: ShardId, sequence: i64) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO stream_checkpoints (shard_id, last_seq, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (shard_id)
            DO UPDATE SET last_seq = $2, updated_at = NOW()
            "#,
        )
        .bind(shard_id.0 as i32)
        .bind(sequence)
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn reset_all(&self) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM stream_checkpoints")
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        Ok(())
    }
}

/// In-memory checkpoints for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<HashMap<ShardId, i64>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, shard_id: ShardId) -> Result<Option<i64>, CheckpointError> {
        Ok(self
            .inner
            .lock()
            .expect("checkpoint lock poisoned")
            .get(&shard_id)
            .copied())
    }

    async fn save(&self, shard_id: ShardId, sequence: i64) -> Result<(), CheckpointError> {
        self.inner
            .lock()
            .expect("checkpoint lock poisoned")
            .insert(shard_id, sequence);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), CheckpointError> {
        self.inner
            .lock()
            .expect("checkpoint lock poisoned")
            .clear();
        Ok(())
    }
}
