//! Relational projection
//!
//! Maintains the analytical read model: account master, transaction ledger,
//! running summary and per-day balance rollups. Each event is applied inside
//! one database transaction, guarded by the transaction ledger's primary key
//! (the event id) so re-delivery leaves every table untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{AccountEvent, AccountType, EventEnvelope};

use super::{ProjectionError, ProjectionTarget, TransactionKind};

/// Relational projection over the four analytical tables.
#[derive(Debug, Clone)]
pub struct RelationalProjection {
    pool: PgPool,
}

impl RelationalProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn already_applied(
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
    ) -> Result<bool, ProjectionError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM transactions WHERE transaction_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(exists)
    }

    async fn apply_opened(
        &self,
        envelope: &EventEnvelope,
        holder: &str,
        account_type: AccountType,
        opening_balance: Decimal,
        created_at: DateTime<Utc>,
    ) -> Result<(), ProjectionError> {
        let mut tx = self.pool.begin().await?;
        let account_id = envelope.aggregate_id;

        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (
                account_id, holder, account_type, balance, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'active', $5, $5)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(holder)
        .bind(account_type.as_str())
        .bind(opening_balance)
        .bind(created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Re-delivered opening event; everything below was already done.
            tx.commit().await?;
            return Ok(());
        }

        let (deposits, count) = if opening_balance > Decimal::ZERO {
            (opening_balance, 1i64)
        } else {
            (Decimal::ZERO, 0i64)
        };

        sqlx::query(
            r#"
            INSERT INTO account_summary (
                account_id, holder, account_type, current_balance,
                total_deposits, total_withdrawals, transaction_count,
                last_transaction_date, account_age_days, status
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, 0, 'active')
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(holder)
        .bind(account_type.as_str())
        .bind(opening_balance)
        .bind(deposits)
        .bind(count)
        .bind(if count > 0 { Some(created_at) } else { None })
        .execute(&mut *tx)
        .await?;

        if opening_balance > Decimal::ZERO {
            Self::insert_ledger_row(
                &mut tx,
                envelope,
                TransactionKind::OpeningDeposit,
                opening_balance,
                opening_balance,
                "Opening deposit",
            )
            .await?;
            Self::upsert_daily_balance(
                &mut tx,
                account_id,
                envelope.timestamp,
                opening_balance,
                opening_balance,
                Decimal::ZERO,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn apply_movement(
        &self,
        envelope: &EventEnvelope,
        kind: TransactionKind,
        amount: Decimal,
    ) -> Result<(), ProjectionError> {
        let mut tx = self.pool.begin().await?;
        let account_id = envelope.aggregate_id;

        if Self::already_applied(&mut tx, envelope.event_id).await? {
            tx.commit().await?;
            return Ok(());
        }

        let delta = match kind {
            TransactionKind::Withdrawal => -amount,
            _ => amount,
        };

        let balance_after: Option<Decimal> = sqlx::query_scalar(
            r#"
            UPDATE accounts
            SET balance = balance + $2, updated_at = $3
            WHERE account_id = $1
            RETURNING balance
            "#,
        )
        .bind(account_id)
        .bind(delta)
        .bind(envelope.timestamp)
        .fetch_optional(&mut *tx)
        .await?;

        let balance_after = balance_after.ok_or(ProjectionError::MissingAccount(account_id))?;

        Self::insert_ledger_row(&mut tx, envelope, kind, amount, balance_after, "").await?;

        let (deposit_delta, withdrawal_delta) = match kind {
            TransactionKind::Withdrawal => (Decimal::ZERO, amount),
            _ => (amount, Decimal::ZERO),
        };

        sqlx::query(
            r#"
            UPDATE account_summary
            SET current_balance = $2,
                total_deposits = total_deposits + $3,
                total_withdrawals = total_withdrawals + $4,
                transaction_count = transaction_count + 1,
                last_transaction_date = $5,
                account_age_days = GREATEST(
                    0,
                    (SELECT (CURRENT_DATE - created_at::date)
                     FROM accounts WHERE account_id = $1)
                )
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(balance_after)
        .bind(deposit_delta)
        .bind(withdrawal_delta)
        .bind(envelope.timestamp)
        .execute(&mut *tx)
        .await?;

        Self::upsert_daily_balance(
            &mut tx,
            account_id,
            envelope.timestamp,
            balance_after,
            deposit_delta,
            withdrawal_delta,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_closed(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        let mut tx = self.pool.begin().await?;
        let account_id = envelope.aggregate_id;

        sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'closed', closed_at = $2, updated_at = $2
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(envelope.timestamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE account_summary SET status = 'closed' WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_ledger_row(
        tx: &mut Transaction<'_, Postgres>,
        envelope: &EventEnvelope,
        kind: TransactionKind,
        amount: Decimal,
        balance_after: Decimal,
        description: &str,
    ) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                transaction_id, account_id, transaction_type,
                amount, balance_after, created_at, description
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(envelope.event_id)
        .bind(envelope.aggregate_id)
        .bind(kind.as_str())
        .bind(amount)
        .bind(balance_after)
        .bind(envelope.timestamp)
        .bind(description)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Accumulating upsert keyed on `(account_id, balance_date)`. The
    /// closing balance is overwritten because per-aggregate delivery order
    /// means the row being applied is the latest for that account.
    async fn upsert_daily_balance(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        timestamp: DateTime<Utc>,
        closing_balance: Decimal,
        deposit_delta: Decimal,
        withdrawal_delta: Decimal,
    ) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            INSERT INTO daily_balances (
                account_id, balance_date, closing_balance,
                daily_deposits, daily_withdrawals, transaction_count
            )
            VALUES ($1, $2, $3, $4, $5, 1)
            ON CONFLICT (account_id, balance_date) DO UPDATE SET
                closing_balance = EXCLUDED.closing_balance,
                daily_deposits = daily_balances.daily_deposits + EXCLUDED.daily_deposits,
                daily_withdrawals = daily_balances.daily_withdrawals + EXCLUDED.daily_withdrawals,
                transaction_count = daily_balances.transaction_count + 1
            "#,
        )
        .bind(account_id)
        .bind(timestamp.date_naive())
        .bind(closing_balance)
        .bind(deposit_delta)
        .bind(withdrawal_delta)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ProjectionTarget for RelationalProjection {
    fn name(&self) -> &'static str {
        "relational"
    }

    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        match &envelope.payload {
            AccountEvent::AccountOpened {
                holder,
                account_type,
                opening_balance,
                created_at,
            } => {
                self.apply_opened(envelope, holder, *account_type, *opening_balance, *created_at)
                    .await
            }
            AccountEvent::FundsDeposited { amount } => {
                self.apply_movement(envelope, TransactionKind::Deposit, *amount)
                    .await
            }
            AccountEvent::FundsWithdrawn { amount } => {
                self.apply_movement(envelope, TransactionKind::Withdrawal, *amount)
                    .await
            }
            AccountEvent::AccountClosed {} => self.apply_closed(envelope).await,
        }
    }
}
