//! In-memory event log
//!
//! Backs the unit and end-to-end tests and local runs without a database.
//! Carries the same contract as the Postgres adapter: all-or-nothing
//! batches, event-id uniqueness, free version slots. Committed events are
//! published into per-shard buffers that `MemoryChangeStream` tails.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::EventEnvelope;
use crate::stream::{shard_for, ChangeKind, ChangeRecord, ShardId};

use super::{validate_batch, EventLog, EventLogError, EventLogResult};

#[derive(Default)]
struct LogInner {
    event_ids: HashSet<Uuid>,
    streams: HashMap<Uuid, Vec<EventEnvelope>>,
    shards: HashMap<ShardId, Vec<ChangeRecord>>,
    next_seq: i64,
}

/// In-memory, mutex-guarded event log with an attached change feed.
#[derive(Clone)]
pub struct MemoryEventLog {
    inner: Arc<Mutex<LogInner>>,
    shard_count: u32,
}

impl MemoryEventLog {
    pub fn new(shard_count: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner::default())),
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Records on one shard strictly after `after_seq`, up to `limit`.
    pub(crate) fn read_shard(
        &self,
        shard_id: ShardId,
        after_seq: i64,
        limit: usize,
    ) -> Vec<ChangeRecord> {
        let inner = self.inner.lock().expect("event log lock poisoned");
        inner
            .shards
            .get(&shard_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.sequence > after_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest sequence published on a shard, or 0 when empty.
    pub(crate) fn latest_seq(&self, shard_id: ShardId) -> i64 {
        let inner = self.inner.lock().expect("event log lock poisoned");
        inner
            .shards
            .get(&shard_id)
            .and_then(|records| records.last())
            .map(|r| r.sequence)
            .unwrap_or(0)
    }

    /// Test hook: publish a MODIFY/REMOVE record, as a misconfigured feed
    /// would.
    pub fn push_drift_record(&self, shard_id: ShardId, kind: ChangeKind) {
        let mut inner = self.inner.lock().expect("event log lock poisoned");
        inner.next_seq += 1;
        let sequence = inner.next_seq;
        inner
            .shards
            .entry(shard_id)
            .or_default()
            .push(ChangeRecord {
                sequence,
                kind,
                event_data: serde_json::Value::Null,
            });
    }

    /// Test hook: publish a record whose body does not decode as an event.
    pub fn push_poison_record(&self, shard_id: ShardId) {
        let mut inner = self.inner.lock().expect("event log lock poisoned");
        inner.next_seq += 1;
        let sequence = inner.next_seq;
        inner
            .shards
            .entry(shard_id)
            .or_default()
            .push(ChangeRecord {
                sequence,
                kind: ChangeKind::Insert,
                event_data: serde_json::Value::String("not an event".to_string()),
            });
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append_atomic(&self, events: Vec<EventEnvelope>) -> EventLogResult<()> {
        validate_batch(&events)?;

        // Encode outside the lock; a serialization failure must not commit
        // anything.
        let mut encoded = Vec::with_capacity(events.len());
        for event in &events {
            encoded.push(event.encode()?);
        }

        let mut inner = self.inner.lock().expect("event log lock poisoned");

        // Validate the whole batch against committed state before touching it.
        let mut claimed: HashMap<Uuid, i64> = HashMap::new();
        for event in &events {
            if inner.event_ids.contains(&event.event_id) {
                return Err(EventLogError::Conflict {
                    aggregate_id: event.aggregate_id,
                    reason: format!("event id {} already exists", event.event_id),
                });
            }

            let expected = claimed.entry(event.aggregate_id).or_insert_with(|| {
                inner
                    .streams
                    .get(&event.aggregate_id)
                    .map(|s| s.len() as i64)
                    .unwrap_or(0)
            });
            if event.version != *expected + 1 {
                return Err(EventLogError::Conflict {
                    aggregate_id: event.aggregate_id,
                    reason: format!(
                        "version slot {} is not free (next free slot is {})",
                        event.version,
                        *expected + 1
                    ),
                });
            }
            *expected += 1;
        }

        for (event, body) in events.into_iter().zip(encoded) {
            inner.event_ids.insert(event.event_id);
            inner.next_seq += 1;
            let sequence = inner.next_seq;
            let shard = shard_for(&event.aggregate_id, self.shard_count);
            inner.shards.entry(shard).or_default().push(ChangeRecord {
                sequence,
                kind: ChangeKind::Insert,
                event_data: body,
            });
            inner
                .streams
                .entry(event.aggregate_id)
                .or_default()
                .push(event);
        }

        Ok(())
    }

    async fn read_stream(&self, aggregate_id: Uuid) -> EventLogResult<Vec<EventEnvelope>> {
        let inner = self.inner.lock().expect("event log lock poisoned");
        Ok(inner.streams.get(&aggregate_id).cloned().unwrap_or_default())
    }

    async fn highest_version(&self, aggregate_id: Uuid) -> EventLogResult<i64> {
        let inner = self.inner.lock().expect("event log lock poisoned");
        Ok(inner
            .streams
            .get(&aggregate_id)
            .and_then(|s| s.last())
            .map(|e| e.version)
            .unwrap_or(0))
    }
}
