//! Domain Events
//!
//! Event definitions and the canonical wire encoding used by the event log
//! and the change stream. Events are immutable facts that have happened in
//! the system.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate type tag carried by every stored event.
pub const ACCOUNT_AGGREGATE: &str = "account";

/// Kind of ledger account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Checking,
    Savings,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "checking",
            AccountType::Savings => "savings",
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account-related events. This is the closed set of facts the log stores;
/// a transfer is represented as a withdrawal plus a deposit committed in one
/// atomic batch, never as an event of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AccountEvent {
    /// Account was opened
    AccountOpened {
        holder: String,
        account_type: AccountType,
        opening_balance: Decimal,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        created_at: DateTime<Utc>,
    },

    /// Money was added to the account
    FundsDeposited { amount: Decimal },

    /// Money was removed from the account
    FundsWithdrawn { amount: Decimal },

    /// Account was closed (requires a zero balance)
    AccountClosed {},
}

impl AccountEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened { .. } => "AccountOpened",
            AccountEvent::FundsDeposited { .. } => "FundsDeposited",
            AccountEvent::FundsWithdrawn { .. } => "FundsWithdrawn",
            AccountEvent::AccountClosed {} => "AccountClosed",
        }
    }

    /// The amount this event moves, if any (signed from the account's view)
    pub fn signed_amount(&self) -> Option<Decimal> {
        match self {
            AccountEvent::FundsDeposited { amount } => Some(*amount),
            AccountEvent::FundsWithdrawn { amount } => Some(-*amount),
            _ => None,
        }
    }
}

/// A fully-addressed event as stored on the log and replayed on the change
/// stream. Field order is fixed; re-encoding a decoded envelope yields the
/// identical document, which is what the idempotency comparisons rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub version: i64,
    pub event_type: String,
    pub payload: AccountEvent,
}

impl EventEnvelope {
    /// Wrap a new account event with a fresh event id and the current time.
    pub fn for_account(aggregate_id: Uuid, version: i64, payload: AccountEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            aggregate_id,
            aggregate_type: ACCOUNT_AGGREGATE.to_string(),
            version,
            event_type: payload.event_type().to_string(),
            payload,
        }
    }

    /// Canonical wire encoding.
    pub fn encode(&self) -> Result<serde_json::Value, CodecError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a stream or storage record back into an envelope.
    ///
    /// Rejects documents whose outer `event_type` disagrees with the payload
    /// tag; such records indicate corruption, not version skew.
    pub fn decode(value: serde_json::Value) -> Result<Self, CodecError> {
        let envelope: EventEnvelope = serde_json::from_value(value)?;
        let tag = envelope.payload.event_type();
        if envelope.event_type != tag {
            return Err(CodecError::TagMismatch {
                declared: envelope.event_type,
                payload: tag,
            });
        }
        Ok(envelope)
    }
}

/// Errors from encoding or decoding events
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("event serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event type tag mismatch: declared {declared}, payload {payload}")]
    TagMismatch {
        declared: String,
        payload: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn opened_at() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn sample_envelope() -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            timestamp: opened_at(),
            aggregate_id: Uuid::new_v4(),
            aggregate_type: ACCOUNT_AGGREGATE.to_string(),
            version: 1,
            event_type: "AccountOpened".to_string(),
            payload: AccountEvent::AccountOpened {
                holder: "Jane".to_string(),
                account_type: AccountType::Checking,
                opening_balance: Decimal::new(100, 0),
                created_at: opened_at(),
            },
        }
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = AccountEvent::FundsDeposited {
            amount: Decimal::new(100, 0),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("FundsDeposited"));

        let deserialized: AccountEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.event_type(), deserialized.event_type());
    }

    #[test]
    fn test_closed_event_has_empty_payload() {
        let event = AccountEvent::AccountClosed {};
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "AccountClosed" }));
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = sample_envelope();

        let encoded = envelope.encode().unwrap();
        let decoded = EventEnvelope::decode(encoded).unwrap();

        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_envelope_reencode_is_identical() {
        let envelope = sample_envelope();

        let first = serde_json::to_string(&envelope.encode().unwrap()).unwrap();
        let decoded = EventEnvelope::decode(envelope.encode().unwrap()).unwrap();
        let second = serde_json::to_string(&decoded.encode().unwrap()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_envelope_timestamp_is_epoch_millis() {
        let envelope = sample_envelope();
        let encoded = envelope.encode().unwrap();

        assert_eq!(
            encoded.get("timestamp"),
            Some(&serde_json::json!(1_700_000_000_000i64))
        );
    }

    #[test]
    fn test_decode_rejects_tag_mismatch() {
        let mut encoded = sample_envelope().encode().unwrap();
        encoded["event_type"] = serde_json::json!("FundsDeposited");

        let err = EventEnvelope::decode(encoded).unwrap_err();
        assert!(matches!(err, CodecError::TagMismatch { .. }));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = EventEnvelope::decode(serde_json::json!("not an event"));
        assert!(err.is_err());
    }

    #[test]
    fn test_signed_amount() {
        let deposit = AccountEvent::FundsDeposited {
            amount: Decimal::new(30, 0),
        };
        let withdrawal = AccountEvent::FundsWithdrawn {
            amount: Decimal::new(20, 0),
        };

        assert_eq!(deposit.signed_amount(), Some(Decimal::new(30, 0)));
        assert_eq!(withdrawal.signed_amount(), Some(Decimal::new(-20, 0)));
        assert_eq!(AccountEvent::AccountClosed {}.signed_amount(), None);
    }
}
