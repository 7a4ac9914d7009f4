//! Common test utilities
//!
//! An in-memory stack wiring the full pipeline (command handlers, event
//! log, change stream, consumer, key-value projection), plus Postgres
//! fixtures for the database-backed integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use account_ledger::event_log::MemoryEventLog;
use account_ledger::handlers::{AccountCommandHandler, TransferHandler};
use account_ledger::projection::{
    KvProjection, KvStore, MemoryKvStore, ProjectionTarget, Projector,
};
use account_ledger::stream::{
    ConsumerConfig, IteratorInit, MemoryChangeStream, MemoryCheckpointStore, StreamConsumer,
};

/// Full write-to-read pipeline over the in-memory adapters.
pub struct TestStack {
    pub log: MemoryEventLog,
    pub stream: Arc<MemoryChangeStream>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub kv: Arc<MemoryKvStore>,
    pub accounts: AccountCommandHandler,
    pub transfers: TransferHandler,
}

impl TestStack {
    pub fn new(shard_count: u32) -> Self {
        let log = MemoryEventLog::new(shard_count);
        let log_port: Arc<dyn account_ledger::event_log::EventLog> = Arc::new(log.clone());

        Self {
            stream: Arc::new(MemoryChangeStream::new(log.clone())),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            kv: Arc::new(MemoryKvStore::new()),
            accounts: AccountCommandHandler::new(log_port.clone(), 3),
            transfers: TransferHandler::new(log_port, 3),
            log,
        }
    }

    fn consumer_config(&self, init: IteratorInit) -> ConsumerConfig {
        ConsumerConfig {
            poll_interval: Duration::from_millis(5),
            batch_limit: 100,
            iterator_init: init,
            call_timeout: Duration::from_millis(500),
            rediscovery_interval: Duration::from_millis(20),
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(50),
        }
    }

    pub fn consumer(&self, init: IteratorInit) -> StreamConsumer {
        let projector = Arc::new(Projector::new(
            vec![Arc::new(KvProjection::new(self.kv.clone())) as Arc<dyn ProjectionTarget>],
            Duration::from_millis(500),
        ));
        StreamConsumer::new(
            self.stream.clone(),
            self.checkpoints.clone(),
            projector,
            self.consumer_config(init),
        )
    }

    /// Project into a separate key-value store, for rebuild comparisons.
    pub fn consumer_into(&self, init: IteratorInit, kv: Arc<MemoryKvStore>) -> StreamConsumer {
        let projector = Arc::new(Projector::new(
            vec![Arc::new(KvProjection::new(kv)) as Arc<dyn ProjectionTarget>],
            Duration::from_millis(500),
        ));
        StreamConsumer::new(
            self.stream.clone(),
            self.checkpoints.clone(),
            projector,
            self.consumer_config(init),
        )
    }

    pub fn start_consumer(&self, init: IteratorInit) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(self.consumer(init).run(rx));
        (tx, task)
    }

    /// Wait until the key-value projection shows the expected balance,
    /// up to a two second deadline.
    pub async fn wait_for_balance(&self, account_id: Uuid, expected: Decimal) {
        wait_for_balance_in(&self.kv, account_id, expected).await
    }
}

pub async fn wait_for_balance_in(kv: &Arc<MemoryKvStore>, account_id: Uuid, expected: Decimal) {
    for _ in 0..200 {
        if let Some(row) = kv.get_balance(account_id).await.unwrap() {
            if row.balance == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("projection did not reach balance {expected} for {account_id}");
}

/// Postgres fixtures: connect to the test database, create the schema on
/// first use, and truncate every table this crate owns.
pub mod pg {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;

    const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        event_id UUID PRIMARY KEY,
        aggregate_id UUID NOT NULL,
        aggregate_type TEXT NOT NULL,
        event_type TEXT NOT NULL,
        version BIGINT NOT NULL,
        shard_id INT NOT NULL,
        stream_seq BIGSERIAL,
        created_at TIMESTAMPTZ NOT NULL,
        event_data JSONB NOT NULL,
        UNIQUE (aggregate_id, version)
    );
    CREATE INDEX IF NOT EXISTS idx_events_shard_seq ON events (shard_id, stream_seq);

    CREATE TABLE IF NOT EXISTS stream_checkpoints (
        shard_id INT PRIMARY KEY,
        last_seq BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS account_balance (
        account_id UUID PRIMARY KEY,
        balance NUMERIC(20, 8) NOT NULL,
        status TEXT NOT NULL,
        holder TEXT NOT NULL,
        account_type TEXT NOT NULL,
        last_updated TIMESTAMPTZ NOT NULL,
        last_version BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS transaction_history (
        transaction_id UUID PRIMARY KEY,
        account_id UUID NOT NULL,
        transaction_type TEXT NOT NULL,
        amount NUMERIC(20, 8) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_history_account_time
        ON transaction_history (account_id, created_at DESC);

    CREATE TABLE IF NOT EXISTS accounts (
        account_id UUID PRIMARY KEY,
        holder TEXT NOT NULL,
        account_type TEXT NOT NULL,
        balance NUMERIC(20, 8) NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        closed_at TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS idx_accounts_holder ON accounts (holder);
    CREATE INDEX IF NOT EXISTS idx_accounts_status ON accounts (status);
    CREATE INDEX IF NOT EXISTS idx_accounts_type ON accounts (account_type);

    CREATE TABLE IF NOT EXISTS transactions (
        transaction_id UUID PRIMARY KEY,
        account_id UUID NOT NULL REFERENCES accounts(account_id),
        transaction_type TEXT NOT NULL,
        amount NUMERIC(20, 8) NOT NULL,
        balance_after NUMERIC(20, 8) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        description TEXT NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions (account_id);
    CREATE INDEX IF NOT EXISTS idx_transactions_time ON transactions (created_at);
    CREATE INDEX IF NOT EXISTS idx_transactions_type ON transactions (transaction_type);

    CREATE TABLE IF NOT EXISTS account_summary (
        account_id UUID PRIMARY KEY REFERENCES accounts(account_id),
        holder TEXT NOT NULL,
        account_type TEXT NOT NULL,
        current_balance NUMERIC(20, 8) NOT NULL,
        total_deposits NUMERIC(20, 8) NOT NULL,
        total_withdrawals NUMERIC(20, 8) NOT NULL,
        transaction_count BIGINT NOT NULL,
        last_transaction_date TIMESTAMPTZ,
        account_age_days INT NOT NULL DEFAULT 0,
        status TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS daily_balances (
        id BIGSERIAL PRIMARY KEY,
        account_id UUID NOT NULL REFERENCES accounts(account_id),
        balance_date DATE NOT NULL,
        closing_balance NUMERIC(20, 8) NOT NULL,
        daily_deposits NUMERIC(20, 8) NOT NULL,
        daily_withdrawals NUMERIC(20, 8) NOT NULL,
        transaction_count BIGINT NOT NULL,
        UNIQUE (account_id, balance_date)
    );
    "#;

    /// Setup test database: create the schema if needed and truncate.
    pub async fn setup_test_db() -> PgPool {
        dotenvy::dotenv().ok();
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .expect("Failed to connect to DB");

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .expect("Failed to create schema");
        }

        sqlx::query(
            "TRUNCATE TABLE events, stream_checkpoints, account_balance, transaction_history, \
             transactions, account_summary, daily_balances, accounts CASCADE",
        )
        .execute(&pool)
        .await
        .expect("Failed to clean up DB");

        pool
    }
}
