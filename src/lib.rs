//! account-ledger Library
//!
//! Write path and projection propagation for an event-sourced account
//! ledger. Commands append to an immutable event log with optimistic
//! concurrency; a sharded change-stream consumer propagates committed
//! events to a key-value and a relational read store.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod domain;
pub mod event_log;
pub mod handlers;
pub mod projection;
pub mod stream;

pub use config::Config;
pub use domain::{AccountEvent, AccountType, DomainError, EventEnvelope};
pub use handlers::{AccountCommandHandler, CommandError, TransferHandler};
