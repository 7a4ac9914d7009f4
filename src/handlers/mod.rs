//! Command Service
//!
//! Orchestrates the write path: load history, reconstitute, validate,
//! append atomically. Returns to the caller as soon as the append commits;
//! projections catch up asynchronously through the change stream.

mod account_handler;
mod commands;
mod transfer_handler;

#[cfg(test)]
mod tests;

pub use account_handler::AccountCommandHandler;
pub use commands::*;
pub use transfer_handler::TransferHandler;

use crate::domain::DomainError;
use crate::event_log::EventLogError;

/// Caller-facing error taxonomy of the command service.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// A business rule was violated; surfaced verbatim, never retried.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Optimistic concurrency lost even after the bounded retry loop.
    #[error("Append conflict persisted after {attempts} attempts")]
    Conflict { attempts: u32 },

    /// Store or network unavailability; not retried here.
    #[error("Event log transport failure: {0}")]
    Transport(String),
}

impl From<EventLogError> for CommandError {
    fn from(error: EventLogError) -> Self {
        match error {
            EventLogError::Conflict { .. } => CommandError::Conflict { attempts: 1 },
            other => CommandError::Transport(other.to_string()),
        }
    }
}

impl CommandError {
    pub fn is_domain(&self) -> bool {
        matches!(self, CommandError::Domain(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CommandError::Conflict { .. })
    }
}
