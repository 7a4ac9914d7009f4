//! Event Log
//!
//! The append-only store of all events and the system's sole source of
//! truth. The port exposes the three operations the write side needs;
//! adapters carry the ACID guarantees (Postgres in production, in-memory
//! for tests and local runs).

mod memory;
mod postgres;

pub use memory::MemoryEventLog;
pub use postgres::PostgresEventLog;

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::EventEnvelope;

pub type EventLogResult<T> = Result<T, EventLogError>;

/// Errors that can occur in the event log
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// Optimistic concurrency failure at commit time: a duplicate event id
    /// or an already-occupied version slot.
    #[error("Append conflict for aggregate {aggregate_id}: {reason}")]
    Conflict { aggregate_id: Uuid, reason: String },

    /// Store or network unavailability, including call timeouts. Not retried
    /// here; upper layers decide.
    #[error("Event log transport failure: {0}")]
    Transport(String),

    /// Event could not be encoded for storage, or a stored row failed to
    /// decode
    #[error("Event codec failure: {0}")]
    Codec(#[from] crate::domain::CodecError),

    /// The append batch itself is malformed (empty, or non-consecutive
    /// versions within an aggregate)
    #[error("Invalid append batch: {0}")]
    InvalidBatch(String),
}

impl EventLogError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventLogError::Conflict { .. })
    }
}

/// Append-only event storage with atomic multi-event commits.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Commit a non-empty batch of events as a single all-or-nothing
    /// transaction. Succeeds iff every event id is new and every version
    /// slot is free; otherwise nothing is written and `Conflict` is
    /// returned.
    async fn append_atomic(&self, events: Vec<EventEnvelope>) -> EventLogResult<()>;

    /// Return the complete stream for one aggregate, ordered by ascending
    /// version.
    async fn read_stream(&self, aggregate_id: Uuid) -> EventLogResult<Vec<EventEnvelope>>;

    /// Highest version recorded for the aggregate, or 0 if it has no events.
    async fn highest_version(&self, aggregate_id: Uuid) -> EventLogResult<i64>;
}

/// Shape check shared by the adapters: the batch must be non-empty, and
/// events for the same aggregate must claim strictly consecutive version
/// slots. Whether the lowest slot is actually free is decided inside the
/// adapter's commit.
pub(crate) fn validate_batch(events: &[EventEnvelope]) -> EventLogResult<()> {
    if events.is_empty() {
        return Err(EventLogError::InvalidBatch(
            "append batch must not be empty".to_string(),
        ));
    }

    let mut last_version: HashMap<Uuid, i64> = HashMap::new();
    for event in events {
        if event.version < 1 {
            return Err(EventLogError::InvalidBatch(format!(
                "event {} claims version {} (must be >= 1)",
                event.event_id, event.version
            )));
        }
        if let Some(prev) = last_version.insert(event.aggregate_id, event.version) {
            if event.version != prev + 1 {
                return Err(EventLogError::InvalidBatch(format!(
                    "aggregate {} versions must be consecutive in a batch (got {} after {})",
                    event.aggregate_id, event.version, prev
                )));
            }
        }
    }

    Ok(())
}
