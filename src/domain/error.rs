//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Business rule violations raised during command validation.
///
/// Each variant carries the offending rule's values so callers can report
/// exactly why a command was rejected. Domain errors are never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Withdrawal or transfer exceeds the available balance
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    /// Operation attempted on a closed account
    #[error("Account {account_id} is closed")]
    AccountClosed { account_id: Uuid },

    /// Deposit or withdrawal amount must be strictly positive
    #[error("Amount must be positive (got {amount})")]
    NonPositiveAmount { amount: Decimal },

    /// Amount carries more fractional digits than the ledger stores
    #[error("Amount has too many decimal places (got {amount})")]
    AmountPrecisionExceeded { amount: Decimal },

    /// Amount, or the balance it would produce, exceeds the maximum the
    /// ledger supports
    #[error("Amount exceeds the maximum supported value (got {amount})")]
    AmountTooLarge { amount: Decimal },

    /// Opening balance must be zero or positive
    #[error("Opening balance must not be negative (got {amount})")]
    NegativeOpeningBalance { amount: Decimal },

    /// Closing requires an exactly zero balance
    #[error("Account balance must be zero before closing (balance {balance})")]
    BalanceNotZero { balance: Decimal },

    /// An open command targeted an aggregate that already has history
    #[error("Account {account_id} already exists")]
    AlreadyOpen { account_id: Uuid },

    /// The referenced account has no events on the log
    #[error("Account not found: {account_id}")]
    AccountNotFound { account_id: Uuid },

    /// Transfer source and destination are the same account
    #[error("Cannot transfer to the same account: {account_id}")]
    SameAccountTransfer { account_id: Uuid },
}

impl DomainError {
    /// Stable machine-readable name of the violated rule.
    pub fn rule(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::AccountClosed { .. } => "account_closed",
            Self::NonPositiveAmount { .. } => "non_positive_amount",
            Self::AmountPrecisionExceeded { .. } => "amount_precision_exceeded",
            Self::AmountTooLarge { .. } => "amount_too_large",
            Self::NegativeOpeningBalance { .. } => "negative_opening_balance",
            Self::BalanceNotZero { .. } => "balance_not_zero",
            Self::AlreadyOpen { .. } => "already_open",
            Self::AccountNotFound { .. } => "account_not_found",
            Self::SameAccountTransfer { .. } => "same_account_transfer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_carries_values() {
        let err = DomainError::InsufficientFunds {
            requested: Decimal::new(20, 0),
            available: Decimal::new(10, 0),
        };

        assert_eq!(err.rule(), "insufficient_funds");
        assert!(err.to_string().contains("20"));
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_rule_names_are_stable() {
        let account_id = Uuid::nil();
        let amount = Decimal::ONE;
        assert_eq!(
            DomainError::AccountClosed { account_id }.rule(),
            "account_closed"
        );
        assert_eq!(
            DomainError::AmountPrecisionExceeded { amount }.rule(),
            "amount_precision_exceeded"
        );
        assert_eq!(
            DomainError::AmountTooLarge { amount }.rule(),
            "amount_too_large"
        );
        assert_eq!(
            DomainError::AccountNotFound { account_id }.rule(),
            "account_not_found"
        );
        assert_eq!(
            DomainError::SameAccountTransfer { account_id }.rule(),
            "same_account_transfer"
        );
    }
}
