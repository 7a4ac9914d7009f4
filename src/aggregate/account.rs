//! Account Aggregate
//!
//! The ledger account as a pure in-memory state machine. State is derived
//! from events, never directly mutated; command methods validate against the
//! current state and emit the events to be persisted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{
    AccountEvent, AccountType, Amount, AmountError, Balance, DomainError, EventEnvelope,
    ACCOUNT_AGGREGATE,
};

use super::Aggregate;

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountStatus {
    #[default]
    Active,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Closed => "closed",
        }
    }
}

/// Account Aggregate
///
/// Reconstituted on demand from its event history; holds no durable identity
/// outside the log.
#[derive(Debug, Clone)]
pub struct Account {
    id: Uuid,
    holder: String,
    account_type: Option<AccountType>,
    balance: Balance,
    status: AccountStatus,
    version: i64,
    created_at: Option<DateTime<Utc>>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            holder: String::new(),
            account_type: None,
            balance: Balance::zero(),
            status: AccountStatus::Active,
            version: 0,
            created_at: None,
        }
    }
}

impl Account {
    /// Fold an aggregate out of its ordered event history.
    ///
    /// Returns `None` for an empty history: the aggregate does not exist.
    pub fn load_from_history(events: &[EventEnvelope]) -> Option<Self> {
        let first = events.first()?;

        let mut account = Account {
            id: first.aggregate_id,
            ..Account::default()
        };
        for envelope in events {
            account = account.apply(envelope.payload.clone());
            debug_assert_eq!(account.version, envelope.version, "version fold drift");
        }

        Some(account)
    }

    /// Validate an open command and emit the opening event.
    ///
    /// The opening balance is run through the same `Balance` constructor the
    /// fold uses, so an emitted event can always be re-applied.
    pub fn open(
        holder: &str,
        account_type: AccountType,
        opening_balance: Decimal,
    ) -> Result<AccountEvent, DomainError> {
        let opening = Balance::new(opening_balance).map_err(|e| match e {
            AmountError::Overflow => DomainError::AmountTooLarge {
                amount: opening_balance,
            },
            _ => DomainError::NegativeOpeningBalance {
                amount: opening_balance,
            },
        })?;

        Ok(AccountEvent::AccountOpened {
            holder: holder.to_string(),
            account_type,
            opening_balance: opening.value(),
            created_at: Utc::now(),
        })
    }

    /// Validate a deposit and emit the event, or reject with the violated rule.
    pub fn deposit(&self, amount: Decimal) -> Result<AccountEvent, DomainError> {
        self.ensure_active()?;
        let amount = Self::valid_amount(amount)?;

        // The resulting balance must stay representable, or replaying the
        // event would fail.
        if self.balance.credit(&amount).is_err() {
            return Err(DomainError::AmountTooLarge {
                amount: amount.value(),
            });
        }

        Ok(AccountEvent::FundsDeposited {
            amount: amount.value(),
        })
    }

    /// Validate a withdrawal and emit the event, or reject with the violated rule.
    pub fn withdraw(&self, amount: Decimal) -> Result<AccountEvent, DomainError> {
        self.ensure_active()?;
        let amount = Self::valid_amount(amount)?;

        if !self.balance.is_sufficient_for(&amount) {
            return Err(DomainError::InsufficientFunds {
                requested: amount.value(),
                available: self.balance.value(),
            });
        }

        Ok(AccountEvent::FundsWithdrawn {
            amount: amount.value(),
        })
    }

    /// Validate closure and emit the event. Closing requires a zero balance.
    pub fn close(&self) -> Result<AccountEvent, DomainError> {
        self.ensure_active()?;

        if !self.balance.is_zero() {
            return Err(DomainError::BalanceNotZero {
                balance: self.balance.value(),
            });
        }

        Ok(AccountEvent::AccountClosed {})
    }

    fn ensure_active(&self) -> Result<(), DomainError> {
        if self.status == AccountStatus::Closed {
            return Err(DomainError::AccountClosed {
                account_id: self.id,
            });
        }
        Ok(())
    }

    fn valid_amount(amount: Decimal) -> Result<Amount, DomainError> {
        Amount::new(amount).map_err(|e| match e {
            AmountError::TooManyDecimals(_) => DomainError::AmountPrecisionExceeded { amount },
            AmountError::Overflow => DomainError::AmountTooLarge { amount },
            _ => DomainError::NonPositiveAmount { amount },
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn account_type(&self) -> Option<AccountType> {
        self.account_type
    }

    pub fn balance(&self) -> &Balance {
        &self.balance
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.status == AccountStatus::Closed
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

impl Aggregate for Account {
    type Event = AccountEvent;

    fn aggregate_type() -> &'static str {
        ACCOUNT_AGGREGATE
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(mut self, event: Self::Event) -> Self {
        match event {
            AccountEvent::AccountOpened {
                holder,
                account_type,
                opening_balance,
                created_at,
            } => {
                self.holder = holder;
                self.account_type = Some(account_type);
                // Safe expect: opening balance was validated when the event was created
                self.balance = Balance::new(opening_balance).expect("Invalid opening balance");
                self.status = AccountStatus::Active;
                self.created_at = Some(created_at);
            }

            AccountEvent::FundsDeposited { amount } => {
                let amt = Amount::new(amount).expect("Invalid amount in event");
                self.balance = self.balance.credit(&amt).expect("Balance overflow");
            }

            AccountEvent::FundsWithdrawn { amount } => {
                let amt = Amount::new(amount).expect("Invalid amount in event");
                self.balance = self.balance.debit(&amt).expect("Balance underflow");
            }

            AccountEvent::AccountClosed {} => {
                self.status = AccountStatus::Closed;
            }
        }

        self.version += 1;
        self
    }
}
