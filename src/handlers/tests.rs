//! Command service tests over the in-memory event log.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{AccountType, DomainError, EventEnvelope};
use crate::event_log::{EventLog, EventLogError, EventLogResult, MemoryEventLog};

use super::*;

fn handlers(log: Arc<dyn EventLog>) -> (AccountCommandHandler, TransferHandler) {
    (
        AccountCommandHandler::new(log.clone(), 3),
        TransferHandler::new(log, 3),
    )
}

async fn open_account(
    handler: &AccountCommandHandler,
    opening: Decimal,
) -> (Uuid, CommandReceipt) {
    let account_id = Uuid::new_v4();
    let receipt = handler
        .open(
            OpenAccountCommand::new(account_id, "Jane", AccountType::Checking)
                .with_opening_balance(opening),
        )
        .await
        .unwrap();
    (account_id, receipt)
}

/// Event log decorator that fails the first N appends with a conflict, then
/// delegates. Simulates losing the optimistic-concurrency race.
struct ConflictingLog {
    inner: MemoryEventLog,
    remaining: AtomicU32,
}

impl ConflictingLog {
    fn new(inner: MemoryEventLog, conflicts: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(conflicts),
        }
    }
}

#[async_trait]
impl EventLog for ConflictingLog {
    async fn append_atomic(&self, events: Vec<EventEnvelope>) -> EventLogResult<()> {
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(EventLogError::Conflict {
                aggregate_id: events[0].aggregate_id,
                reason: "injected conflict".to_string(),
            });
        }
        self.inner.append_atomic(events).await
    }

    async fn read_stream(&self, aggregate_id: Uuid) -> EventLogResult<Vec<EventEnvelope>> {
        self.inner.read_stream(aggregate_id).await
    }

    async fn highest_version(&self, aggregate_id: Uuid) -> EventLogResult<i64> {
        self.inner.highest_version(aggregate_id).await
    }
}

#[tokio::test]
async fn test_open_deposit_withdraw_pipeline() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(2));
    let (accounts, _) = handlers(log.clone());

    let (account_id, receipt) = open_account(&accounts, Decimal::new(50, 0)).await;
    assert_eq!(receipt.version, 1);
    assert_eq!(receipt.balance, Decimal::new(50, 0));

    let receipt = accounts
        .deposit(DepositCommand {
            account_id,
            amount: Decimal::new(30, 0),
        })
        .await
        .unwrap();
    assert_eq!(receipt.version, 2);
    assert_eq!(receipt.balance, Decimal::new(80, 0));

    let receipt = accounts
        .withdraw(WithdrawCommand {
            account_id,
            amount: Decimal::new(20, 0),
        })
        .await
        .unwrap();
    assert_eq!(receipt.version, 3);
    assert_eq!(receipt.balance, Decimal::new(60, 0));

    let versions: Vec<i64> = log
        .read_stream(account_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_open_twice_is_rejected() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(2));
    let (accounts, _) = handlers(log);

    let (account_id, _) = open_account(&accounts, Decimal::ZERO).await;

    let err = accounts
        .open(OpenAccountCommand::new(
            account_id,
            "Jane again",
            AccountType::Savings,
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Domain(DomainError::AlreadyOpen { .. })
    ));
}

#[tokio::test]
async fn test_commands_on_unknown_account() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(2));
    let (accounts, _) = handlers(log);
    let account_id = Uuid::new_v4();

    let err = accounts
        .deposit(DepositCommand {
            account_id,
            amount: Decimal::new(5, 0),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Domain(DomainError::AccountNotFound { .. })
    ));
}

#[tokio::test]
async fn test_insufficient_funds_leaves_log_untouched() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(2));
    let (accounts, _) = handlers(log.clone());

    let (account_id, _) = open_account(&accounts, Decimal::new(10, 0)).await;

    let err = accounts
        .withdraw(WithdrawCommand {
            account_id,
            amount: Decimal::new(20, 0),
        })
        .await
        .unwrap_err();

    match err {
        CommandError::Domain(DomainError::InsufficientFunds {
            requested,
            available,
        }) => {
            assert_eq!(requested, Decimal::new(20, 0));
            assert_eq!(available, Decimal::new(10, 0));
        }
        other => panic!("expected insufficient funds, got {other:?}"),
    }

    assert_eq!(log.read_stream(account_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_close_lifecycle() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(2));
    let (accounts, _) = handlers(log);

    let (account_id, _) = open_account(&accounts, Decimal::new(10, 0)).await;

    let err = accounts
        .close(CloseAccountCommand { account_id })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Domain(DomainError::BalanceNotZero { .. })
    ));

    accounts
        .withdraw(WithdrawCommand {
            account_id,
            amount: Decimal::new(10, 0),
        })
        .await
        .unwrap();
    accounts
        .close(CloseAccountCommand { account_id })
        .await
        .unwrap();

    let err = accounts
        .deposit(DepositCommand {
            account_id,
            amount: Decimal::new(1, 0),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Domain(DomainError::AccountClosed { .. })
    ));
}

#[tokio::test]
async fn test_transfer_commits_both_legs_atomically() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(4));
    let (accounts, transfers) = handlers(log.clone());

    let (from, _) = open_account(&accounts, Decimal::new(100, 0)).await;
    let (to, _) = open_account(&accounts, Decimal::ZERO).await;

    let receipt = transfers
        .execute(TransferCommand {
            from_account_id: from,
            to_account_id: to,
            amount: Decimal::new(40, 0),
        })
        .await
        .unwrap();
    assert_eq!(receipt.from_version, 2);
    assert_eq!(receipt.to_version, 2);

    let from_events = log.read_stream(from).await.unwrap();
    let to_events = log.read_stream(to).await.unwrap();
    assert_eq!(from_events.len(), 2);
    assert_eq!(to_events.len(), 2);
    assert_eq!(from_events[1].event_type, "FundsWithdrawn");
    assert_eq!(to_events[1].event_type, "FundsDeposited");

    let from_balance = accounts
        .deposit(DepositCommand {
            account_id: from,
            amount: Decimal::new(1, 0),
        })
        .await
        .unwrap()
        .balance;
    assert_eq!(from_balance, Decimal::new(61, 0));
}

#[tokio::test]
async fn test_transfer_to_same_account_rejected() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(2));
    let (accounts, transfers) = handlers(log);

    let (account_id, _) = open_account(&accounts, Decimal::new(100, 0)).await;

    let err = transfers
        .execute(TransferCommand {
            from_account_id: account_id,
            to_account_id: account_id,
            amount: Decimal::new(10, 0),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Domain(DomainError::SameAccountTransfer { .. })
    ));
}

#[tokio::test]
async fn test_failed_transfer_writes_nothing() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(4));
    let (accounts, transfers) = handlers(log.clone());

    let (from, _) = open_account(&accounts, Decimal::new(10, 0)).await;
    let (to, _) = open_account(&accounts, Decimal::ZERO).await;

    // Insufficient funds on the source leg
    let err = transfers
        .execute(TransferCommand {
            from_account_id: from,
            to_account_id: to,
            amount: Decimal::new(20, 0),
        })
        .await
        .unwrap_err();
    assert!(err.is_domain());
    assert_eq!(log.read_stream(from).await.unwrap().len(), 1);
    assert_eq!(log.read_stream(to).await.unwrap().len(), 1);

    // Unknown destination
    let err = transfers
        .execute(TransferCommand {
            from_account_id: from,
            to_account_id: Uuid::new_v4(),
            amount: Decimal::new(5, 0),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Domain(DomainError::AccountNotFound { .. })
    ));
    assert_eq!(log.read_stream(from).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_conflict_is_retried_and_succeeds() {
    let inner = MemoryEventLog::new(2);
    let log: Arc<dyn EventLog> = Arc::new(ConflictingLog::new(inner.clone(), 0));
    let (accounts, _) = handlers(log);
    let (account_id, _) = open_account(&accounts, Decimal::ZERO).await;

    // One injected conflict, then the append lands on the second attempt.
    let log: Arc<dyn EventLog> = Arc::new(ConflictingLog::new(inner.clone(), 1));
    let accounts = AccountCommandHandler::new(log, 3);

    let receipt = accounts
        .deposit(DepositCommand {
            account_id,
            amount: Decimal::new(10, 0),
        })
        .await
        .unwrap();
    assert_eq!(receipt.version, 2);
    assert_eq!(inner.highest_version(account_id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_conflict_surfaces_after_bounded_retries() {
    let inner = MemoryEventLog::new(2);
    let setup: Arc<dyn EventLog> = Arc::new(ConflictingLog::new(inner.clone(), 0));
    let (accounts, _) = handlers(setup);
    let (account_id, _) = open_account(&accounts, Decimal::ZERO).await;

    let log: Arc<dyn EventLog> = Arc::new(ConflictingLog::new(inner, 10));
    let accounts = AccountCommandHandler::new(log, 3);

    let err = accounts
        .deposit(DepositCommand {
            account_id,
            amount: Decimal::new(10, 0),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::Conflict { attempts: 3 }));
}

#[tokio::test]
async fn test_concurrent_deposits_both_land_without_gaps() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(2));
    let (accounts, _) = handlers(log.clone());
    let (account_id, _) = open_account(&accounts, Decimal::ZERO).await;

    let accounts = Arc::new(AccountCommandHandler::new(log.clone(), 5));
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let accounts = accounts.clone();
        tasks.push(tokio::spawn(async move {
            accounts
                .deposit(DepositCommand {
                    account_id,
                    amount: Decimal::new(10, 0),
                })
                .await
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let events = log.read_stream(account_id).await.unwrap();
    let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);

    let receipt = accounts
        .withdraw(WithdrawCommand {
            account_id,
            amount: Decimal::new(20, 0),
        })
        .await
        .unwrap();
    assert_eq!(receipt.balance, Decimal::ZERO);
}
