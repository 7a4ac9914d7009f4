//! Postgres event log
//!
//! Production adapter. The `events` table keys on `event_id`; a unique index
//! on `(aggregate_id, version)` guards the version slots, so both halves of
//! the optimistic-concurrency check are enforced inside the same
//! transaction. Rows carry the canonical serialized envelope plus the
//! denormalized columns the change feed reads.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::EventEnvelope;
use crate::stream::shard_for;

use super::{validate_batch, EventLog, EventLogError, EventLogResult};

const DEFAULT_PAGE_SIZE: i64 = 500;

/// Event log backed by Postgres.
#[derive(Debug, Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
    shard_count: u32,
    call_timeout: Duration,
    page_size: i64,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool, shard_count: u32, call_timeout: Duration) -> Self {
        Self {
            pool,
            shard_count: shard_count.max(1),
            call_timeout,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    async fn with_timeout<T, F>(&self, operation: &'static str, fut: F) -> EventLogResult<T>
    where
        F: Future<Output = EventLogResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EventLogError::Transport(format!(
                "{operation} exceeded {}ms deadline",
                self.call_timeout.as_millis()
            ))),
        }
    }

    async fn try_append(&self, events: &[EventEnvelope]) -> EventLogResult<()> {
        let mut encoded = Vec::with_capacity(events.len());
        for event in events {
            encoded.push(event.encode()?);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EventLogError::Transport(e.to_string()))?;

        // The batch's lowest claimed slot per aggregate must follow the
        // committed head; the unique index below backstops races that slip
        // past this read.
        let mut lowest: HashMap<Uuid, i64> = HashMap::new();
        for event in events {
            lowest.entry(event.aggregate_id).or_insert(event.version);
        }
        for (aggregate_id, first_version) in lowest {
            let current: i64 = sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MAX(version) FROM events WHERE aggregate_id = $1",
            )
            .bind(aggregate_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| EventLogError::Transport(e.to_string()))?
            .flatten()
            .unwrap_or(0);

            if first_version != current + 1 {
                return Err(EventLogError::Conflict {
                    aggregate_id,
                    reason: format!(
                        "version slot {first_version} is not free (next free slot is {})",
                        current + 1
                    ),
                });
            }
        }

        for (event, body) in events.iter().zip(&encoded) {
            let shard = shard_for(&event.aggregate_id, self.shard_count);
            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id, aggregate_id, aggregate_type,
                    event_type, version, shard_id, created_at, event_data
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id)
            .bind(event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(event.version)
            .bind(shard.0 as i32)
            .bind(event.timestamp)
            .bind(body)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_insert_error(event.aggregate_id, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| EventLogError::Transport(e.to_string()))?;

        Ok(())
    }
}

/// Unique violations (duplicate event id or occupied version slot) are
/// optimistic-concurrency conflicts; everything else is transport.
fn classify_insert_error(aggregate_id: Uuid, err: sqlx::Error) -> EventLogError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return EventLogError::Conflict {
                aggregate_id,
                reason: db
                    .constraint()
                    .map(|c| format!("unique constraint {c} violated"))
                    .unwrap_or_else(|| "unique constraint violated".to_string()),
            };
        }
    }
    EventLogError::Transport(err.to_string())
}

#[async_trait]
impl EventLog for PostgresEventLog {
    async fn append_atomic(&self, events: Vec<EventEnvelope>) -> EventLogResult<()> {
        validate_batch(&events)?;
        self.with_timeout("append_atomic", self.try_append(&events))
            .await
    }

    async fn read_stream(&self, aggregate_id: Uuid) -> EventLogResult<Vec<EventEnvelope>> {
        self.with_timeout("read_stream", async {
            let mut events = Vec::new();
            let mut after_version = 0i64;

            loop {
                let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
                    r#"
                    SELECT event_data FROM events
                    WHERE aggregate_id = $1 AND version > $2
                    ORDER BY version ASC
                    LIMIT $3
                    "#,
                )
                .bind(aggregate_id)
                .bind(after_version)
                .bind(self.page_size)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| EventLogError::Transport(e.to_string()))?;

                let page_len = rows.len();
                for (body,) in rows {
                    let envelope = EventEnvelope::decode(body)?;
                    after_version = envelope.version;
                    events.push(envelope);
                }

                if (page_len as i64) < self.page_size {
                    break;
                }
            }

            Ok(events)
        })
        .await
    }

    async fn highest_version(&self, aggregate_id: Uuid) -> EventLogResult<i64> {
        self.with_timeout("highest_version", async {
            let version: Option<i64> = sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MAX(version) FROM events WHERE aggregate_id = $1",
            )
            .bind(aggregate_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EventLogError::Transport(e.to_string()))?
            .flatten();

            Ok(version.unwrap_or(0))
        })
        .await
    }
}
