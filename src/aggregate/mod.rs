//! Aggregate module
//!
//! Aggregate Root pattern for the event-sourced write side.

pub mod account;

pub use account::{Account, AccountStatus};

/// Aggregate trait implemented by every event-sourced state machine
pub trait Aggregate: Sized + Default {
    /// The type of events this aggregate handles
    type Event;

    /// Get the aggregate type name (for storage)
    fn aggregate_type() -> &'static str;

    /// Get the aggregate ID
    fn id(&self) -> uuid::Uuid;

    /// Get the current version (number of events applied)
    fn version(&self) -> i64;

    /// Apply an event to update the aggregate state
    fn apply(self, event: Self::Event) -> Self;
}
