//! Postgres change stream
//!
//! Polling change feed over the `events` table. Shards are the logical
//! partitions written by the log adapter (`shard_id` column); shard-local
//! order is ascending `stream_seq`. Shards here never close; splits and
//! merges only happen on feeds with managed partitioning.

use async_trait::async_trait;
use sqlx::PgPool;

use super::{
    ChangeKind, ChangeRecord, ChangeStream, RecordBatch, ShardId, ShardIterator, StreamError,
    StreamPosition,
};

/// Change feed over the Postgres event log.
#[derive(Debug, Clone)]
pub struct PostgresChangeStream {
    pool: PgPool,
    shard_count: u32,
}

impl PostgresChangeStream {
    pub fn new(pool: PgPool, shard_count: u32) -> Self {
        Self {
            pool,
            shard_count: shard_count.max(1),
        }
    }
}

#[async_trait]
impl ChangeStream for PostgresChangeStream {
    async fn list_shards(&self) -> Result<Vec<ShardId>, StreamError> {
        Ok((0..self.shard_count).map(ShardId).collect())
    }

    async fn shard_iterator(
        &self,
        shard_id: ShardId,
        position: StreamPosition,
    ) -> Result<ShardIterator, StreamError> {
        if shard_id.0 >= self.shard_count {
            return Err(StreamError::UnknownShard(shard_id));
        }

        let after_seq = match position {
            StreamPosition::TrimHorizon => 0,
            StreamPosition::AfterSequence(seq) => seq,
            StreamPosition::Latest => {
                sqlx::query_scalar::<_, Option<i64>>(
                    "SELECT MAX(stream_seq) FROM events WHERE shard_id = $1",
                )
                .bind(shard_id.0 as i32)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StreamError::Transport(e.to_string()))?
                .flatten()
                .unwrap_or(0)
            }
        };

        Ok(ShardIterator { shard_id, after_seq })
    }

    async fn read_batch(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<RecordBatch, StreamError> {
        let rows: Vec<(i64, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT stream_seq, event_data FROM events
            WHERE shard_id = $1 AND stream_seq > $2
            ORDER BY stream_seq ASC
            LIMIT $3
            "#,
        )
        .bind(iterator.shard_id.0 as i32)
        .bind(iterator.after_seq)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StreamError::Transport(e.to_string()))?;

        let records: Vec<ChangeRecord> = rows
            .into_iter()
            .map(|(sequence, event_data)| ChangeRecord {
                sequence,
                kind: ChangeKind::Insert,
                event_data,
            })
            .collect();

        let after_seq = records
            .last()
            .map(|r| r.sequence)
            .unwrap_or(iterator.after_seq);

        Ok(RecordBatch {
            records,
            next: Some(ShardIterator {
                shard_id: iterator.shard_id,
                after_seq,
            }),
        })
    }
}
