//! Command definitions
//!
//! Commands represent intentions to change the ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::AccountType;

/// Command to open a new account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAccountCommand {
    pub account_id: Uuid,
    pub holder: String,
    pub account_type: AccountType,
    pub opening_balance: Decimal,
}

impl OpenAccountCommand {
    pub fn new(account_id: Uuid, holder: impl Into<String>, account_type: AccountType) -> Self {
        Self {
            account_id,
            holder: holder.into(),
            account_type,
            opening_balance: Decimal::ZERO,
        }
    }

    pub fn with_opening_balance(mut self, opening_balance: Decimal) -> Self {
        self.opening_balance = opening_balance;
        self
    }
}

/// Command to deposit funds into an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositCommand {
    pub account_id: Uuid,
    pub amount: Decimal,
}

/// Command to withdraw funds from an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawCommand {
    pub account_id: Uuid,
    pub amount: Decimal,
}

/// Command to close an account (requires a zero balance)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseAccountCommand {
    pub account_id: Uuid,
}

/// Command to move funds between two accounts atomically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCommand {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: Decimal,
}

/// Receipt for a successful single-account command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub account_id: Uuid,
    pub event_id: Uuid,
    /// Version of the event that was committed
    pub version: i64,
    /// Balance after the command
    pub balance: Decimal,
}

/// Receipt for a successful transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: Decimal,
    pub from_version: i64,
    pub to_version: i64,
}
