//! Domain module
//!
//! Events, monetary primitives and error taxonomy. Everything here is pure:
//! no storage, no IO.

pub mod amount;
pub mod error;
pub mod events;

pub use amount::{Amount, AmountError, Balance};
pub use error::DomainError;
pub use events::{AccountEvent, AccountType, CodecError, EventEnvelope, ACCOUNT_AGGREGATE};
