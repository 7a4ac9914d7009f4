//! Projection module
//!
//! Applies committed events to the read-optimized stores. Delivery from the
//! stream is at-least-once, so every handler here is idempotent: re-applying
//! an event is a no-op for already-applied state.
//!
//! The two targets (key-value and relational) are attempted independently;
//! a failure in one never blocks the other, and neither blocks the stream
//! consumer.

pub mod kv;
pub mod relational;

pub use kv::{
    BalanceRow, KvError, KvProjection, KvStore, MemoryKvStore, PostgresKvStore, TransactionKind,
    TransactionRow,
};
pub use relational::RelationalProjection;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::EventEnvelope;

/// Errors from a projection target
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("Key-value store failure: {0}")]
    Kv(#[from] KvError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An event arrived for an account whose balance row was never created.
    /// Per-aggregate delivery order makes this transient; re-delivery heals
    /// it once the opening event lands.
    #[error("Projection has no account row for {0}")]
    MissingAccount(Uuid),

    #[error("Projection write exceeded its deadline")]
    Timeout,
}

/// One read-store target for committed events.
#[async_trait]
pub trait ProjectionTarget: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply a single event. Must be idempotent under re-delivery.
    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError>;
}

/// Outcome of projecting one event across all targets.
#[derive(Debug)]
pub struct ProjectionReport {
    pub outcomes: Vec<(&'static str, Result<(), ProjectionError>)>,
}

impl ProjectionReport {
    pub fn fully_applied(&self) -> bool {
        self.outcomes.iter().all(|(_, result)| result.is_ok())
    }

    pub fn failed_targets(&self) -> Vec<&'static str> {
        self.outcomes
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Fans each event out to every configured target, isolating failures per
/// target.
pub struct Projector {
    targets: Vec<Arc<dyn ProjectionTarget>>,
    call_timeout: Duration,
}

impl Projector {
    pub fn new(targets: Vec<Arc<dyn ProjectionTarget>>, call_timeout: Duration) -> Self {
        Self {
            targets,
            call_timeout,
        }
    }

    /// Apply one event to all targets. Errors are logged per target and
    /// reported; they are never propagated, so the stream stays live.
    pub async fn apply(&self, envelope: &EventEnvelope) -> ProjectionReport {
        let mut outcomes = Vec::with_capacity(self.targets.len());

        for target in &self.targets {
            let result = match tokio::time::timeout(self.call_timeout, target.apply(envelope)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProjectionError::Timeout),
            };

            if let Err(error) = &result {
                tracing::error!(
                    target = target.name(),
                    event_id = %envelope.event_id,
                    aggregate_id = %envelope.aggregate_id,
                    version = envelope.version,
                    %error,
                    "projection target rejected event"
                );
            }

            outcomes.push((target.name(), result));
        }

        ProjectionReport { outcomes }
    }
}
