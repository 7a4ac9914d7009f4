//! Key-value projection
//!
//! One balance row per account for point lookups, plus an append-only
//! transaction history indexed for "recent transactions by account, newest
//! first".
//!
//! Idempotency: balance writes are conditional on the last-applied event
//! version stored in the row, and transaction inserts key on the event id,
//! so any interleaving of re-deliveries converges to the same state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::aggregate::AccountStatus;
use crate::domain::{AccountEvent, AccountType, EventEnvelope};

use super::{ProjectionError, ProjectionTarget};

/// Transaction classification in the history table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    OpeningDeposit,
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::OpeningDeposit => "OPENING_DEPOSIT",
            TransactionKind::Deposit => "DEPOSIT",
            TransactionKind::Withdrawal => "WITHDRAWAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPENING_DEPOSIT" => Some(TransactionKind::OpeningDeposit),
            "DEPOSIT" => Some(TransactionKind::Deposit),
            "WITHDRAWAL" => Some(TransactionKind::Withdrawal),
            _ => None,
        }
    }
}

/// Current state of one account (table `account_balance`)
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRow {
    pub account_id: Uuid,
    pub balance: Decimal,
    pub status: AccountStatus,
    pub holder: String,
    pub account_type: AccountType,
    pub last_updated: DateTime<Utc>,
    /// Version of the last event applied to this row; the conditional-put
    /// guard.
    pub last_version: i64,
}

/// One history entry (table `transaction_history`)
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRow {
    /// Equals the event id, which is what makes duplicate inserts no-ops.
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Errors from the key-value store
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Key-value store unavailable: {0}")]
    Store(String),

    #[error("Corrupt key-value row: {0}")]
    Corrupt(String),
}

/// The key-value store primitives the projection needs: a conditional put
/// on the balance row and an absent-only insert on the history.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_balance(&self, account_id: Uuid) -> Result<Option<BalanceRow>, KvError>;

    /// Write the balance row iff it is absent or its `last_version` is below
    /// the row being written. Returns false when the condition failed (the
    /// row was already at or past this version).
    async fn put_balance(&self, row: BalanceRow) -> Result<bool, KvError>;

    /// Insert a history entry iff no entry with the same transaction id
    /// exists. Returns false on duplicates.
    async fn insert_transaction(&self, row: TransactionRow) -> Result<bool, KvError>;

    /// Recent history for one account, newest first.
    async fn recent_transactions(
        &self,
        account_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TransactionRow>, KvError>;
}

/// The event handler for the key-value target.
pub struct KvProjection {
    store: Arc<dyn KvStore>,
}

impl KvProjection {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn apply_opened(
        &self,
        envelope: &EventEnvelope,
        holder: &str,
        account_type: AccountType,
        opening_balance: Decimal,
    ) -> Result<(), ProjectionError> {
        self.store
            .put_balance(BalanceRow {
                account_id: envelope.aggregate_id,
                balance: opening_balance,
                status: AccountStatus::Active,
                holder: holder.to_string(),
                account_type,
                last_updated: envelope.timestamp,
                last_version: envelope.version,
            })
            .await?;

        if opening_balance > Decimal::ZERO {
            self.store
                .insert_transaction(TransactionRow {
                    transaction_id: envelope.event_id,
                    account_id: envelope.aggregate_id,
                    kind: TransactionKind::OpeningDeposit,
                    amount: opening_balance,
                    timestamp: envelope.timestamp,
                })
                .await?;
        }

        Ok(())
    }

    async fn apply_movement(
        &self,
        envelope: &EventEnvelope,
        kind: TransactionKind,
        delta: Decimal,
        amount: Decimal,
    ) -> Result<(), ProjectionError> {
        let current = self
            .store
            .get_balance(envelope.aggregate_id)
            .await?
            .ok_or(ProjectionError::MissingAccount(envelope.aggregate_id))?;

        // The version guard makes the balance delta apply exactly once even
        // when the record is delivered again.
        if current.last_version < envelope.version {
            self.store
                .put_balance(BalanceRow {
                    balance: current.balance + delta,
                    last_updated: envelope.timestamp,
                    last_version: envelope.version,
                    ..current
                })
                .await?;
        }

        self.store
            .insert_transaction(TransactionRow {
                transaction_id: envelope.event_id,
                account_id: envelope.aggregate_id,
                kind,
                amount,
                timestamp: envelope.timestamp,
            })
            .await?;

        Ok(())
    }

    async fn apply_closed(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        let current = self
            .store
            .get_balance(envelope.aggregate_id)
            .await?
            .ok_or(ProjectionError::MissingAccount(envelope.aggregate_id))?;

        if current.last_version < envelope.version {
            self.store
                .put_balance(BalanceRow {
                    status: AccountStatus::Closed,
                    last_updated: envelope.timestamp,
                    last_version: envelope.version,
                    ..current
                })
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ProjectionTarget for KvProjection {
    fn name(&self) -> &'static str {
        "kv"
    }

    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        match &envelope.payload {
            AccountEvent::AccountOpened {
                holder,
                account_type,
                opening_balance,
                ..
            } => {
                self.apply_opened(envelope, holder, *account_type, *opening_balance)
                    .await
            }
            AccountEvent::FundsDeposited { amount } => {
                self.apply_movement(envelope, TransactionKind::Deposit, *amount, *amount)
                    .await
            }
            AccountEvent::FundsWithdrawn { amount } => {
                self.apply_movement(envelope, TransactionKind::Withdrawal, -*amount, *amount)
                    .await
            }
            AccountEvent::AccountClosed {} => self.apply_closed(envelope).await,
        }
    }
}

// =========================================================================
// In-memory adapter
// =========================================================================

#[derive(Default)]
struct MemoryKvInner {
    balances: HashMap<Uuid, BalanceRow>,
    transactions: HashMap<Uuid, TransactionRow>,
    by_account: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory key-value store for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<MemoryKvInner>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: make every write fail with a store error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::Store("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_balance(&self, account_id: Uuid) -> Result<Option<BalanceRow>, KvError> {
        Ok(self
            .inner
            .lock()
            .expect("kv lock poisoned")
            .balances
            .get(&account_id)
            .cloned())
    }

    async fn put_balance(&self, row: BalanceRow) -> Result<bool, KvError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().expect("kv lock poisoned");

        let stale = inner
            .balances
            .get(&row.account_id)
            .is_some_and(|existing| existing.last_version >= row.last_version);
        if stale {
            return Ok(false);
        }

        inner.balances.insert(row.account_id, row);
        Ok(true)
    }

    async fn insert_transaction(&self, row: TransactionRow) -> Result<bool, KvError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().expect("kv lock poisoned");

        if inner.transactions.contains_key(&row.transaction_id) {
            return Ok(false);
        }

        inner
            .by_account
            .entry(row.account_id)
            .or_default()
            .push(row.transaction_id);
        inner.transactions.insert(row.transaction_id, row);
        Ok(true)
    }

    async fn recent_transactions(
        &self,
        account_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TransactionRow>, KvError> {
        let inner = self.inner.lock().expect("kv lock poisoned");

        let mut rows: Vec<TransactionRow> = inner
            .by_account
            .get(&account_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.transactions.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(limit);
        Ok(rows)
    }
}

// =========================================================================
// Postgres adapter
// =========================================================================

/// Key-value projection tables hosted on Postgres (`account_balance` and
/// `transaction_history`), with the conditional-put semantics expressed as
/// guarded upserts.
#[derive(Debug, Clone)]
pub struct PostgresKvStore {
    pool: PgPool,
}

impl PostgresKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for PostgresKvStore {
    async fn get_balance(&self, account_id: Uuid) -> Result<Option<BalanceRow>, KvError> {
        let row: Option<(Uuid, Decimal, String, String, String, DateTime<Utc>, i64)> =
            sqlx::query_as(
                r#"
                SELECT account_id, balance, status, holder, account_type, last_updated, last_version
                FROM account_balance
                WHERE account_id = $1
                "#,
            )
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;

        row.map(
            |(account_id, balance, status, holder, account_type, last_updated, last_version)| {
                let status = match status.as_str() {
                    "active" => AccountStatus::Active,
                    "closed" => AccountStatus::Closed,
                    other => return Err(KvError::Corrupt(format!("unknown status {other}"))),
                };
                let account_type = match account_type.as_str() {
                    "checking" => AccountType::Checking,
                    "savings" => AccountType::Savings,
                    other => {
                        return Err(KvError::Corrupt(format!("unknown account type {other}")))
                    }
                };

                Ok(BalanceRow {
                    account_id,
                    balance,
                    status,
                    holder,
                    account_type,
                    last_updated,
                    last_version,
                })
            },
        )
        .transpose()
    }

    async fn put_balance(&self, row: BalanceRow) -> Result<bool, KvError> {
        let result = sqlx::query(
            r#"
            INSERT INTO account_balance (
                account_id, balance, status, holder, account_type, last_updated, last_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (account_id) DO UPDATE SET
                balance = EXCLUDED.balance,
                status = EXCLUDED.status,
                holder = EXCLUDED.holder,
                account_type = EXCLUDED.account_type,
                last_updated = EXCLUDED.last_updated,
                last_version = EXCLUDED.last_version
            WHERE account_balance.last_version < EXCLUDED.last_version
            "#,
        )
        .bind(row.account_id)
        .bind(row.balance)
        .bind(row.status.as_str())
        .bind(row.holder)
        .bind(row.account_type.as_str())
        .bind(row.last_updated)
        .bind(row.last_version)
        .execute(&self.pool)
        .await
        .map_err(|e| KvError::Store(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_transaction(&self, row: TransactionRow) -> Result<bool, KvError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transaction_history (
                transaction_id, account_id, transaction_type, amount, created_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(row.transaction_id)
        .bind(row.account_id)
        .bind(row.kind.as_str())
        .bind(row.amount)
        .bind(row.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| KvError::Store(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn recent_transactions(
        &self,
        account_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TransactionRow>, KvError> {
        let rows: Vec<(Uuid, Uuid, String, Decimal, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT transaction_id, account_id, transaction_type, amount, created_at
            FROM transaction_history
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KvError::Store(e.to_string()))?;

        rows.into_iter()
            .map(|(transaction_id, account_id, kind, amount, timestamp)| {
                let kind = TransactionKind::parse(&kind)
                    .ok_or_else(|| KvError::Corrupt(format!("unknown transaction type {kind}")))?;
                Ok(TransactionRow {
                    transaction_id,
                    account_id,
                    kind,
                    amount,
                    timestamp,
                })
            })
            .collect()
    }
}
