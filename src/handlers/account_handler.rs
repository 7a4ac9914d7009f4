//! Account command handler
//!
//! The write-path pipeline for single-account commands: read the aggregate's
//! history, reconstitute, validate, append atomically. On an append conflict
//! the whole pipeline restarts from the read, a bounded number of times,
//! because the losing producer must re-validate against the state that beat
//! it to the version slot.
//!
//! The handler writes no projections; the read side catches up through the
//! change stream.

use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::{Account, Aggregate};
use crate::domain::{AccountEvent, DomainError, EventEnvelope};
use crate::event_log::{EventLog, EventLogError};

use super::commands::{
    CloseAccountCommand, CommandReceipt, DepositCommand, OpenAccountCommand, WithdrawCommand,
};
use super::CommandError;

/// Handler for open/deposit/withdraw/close
pub struct AccountCommandHandler {
    log: Arc<dyn EventLog>,
    retry_max: u32,
}

impl AccountCommandHandler {
    pub fn new(log: Arc<dyn EventLog>, retry_max: u32) -> Self {
        Self {
            log,
            retry_max: retry_max.max(1),
        }
    }

    /// Open a new account. The aggregate must have no history.
    pub async fn open(&self, command: OpenAccountCommand) -> Result<CommandReceipt, CommandError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let history = self.log.read_stream(command.account_id).await?;
            if !history.is_empty() {
                return Err(DomainError::AlreadyOpen {
                    account_id: command.account_id,
                }
                .into());
            }

            let event = Account::open(
                &command.holder,
                command.account_type,
                command.opening_balance,
            )?;
            let envelope = EventEnvelope::for_account(command.account_id, 1, event);
            let event_id = envelope.event_id;

            match self.log.append_atomic(vec![envelope]).await {
                Ok(()) => {
                    return Ok(CommandReceipt {
                        account_id: command.account_id,
                        event_id,
                        version: 1,
                        balance: command.opening_balance,
                    })
                }
                Err(error) => self.handle_append_error(error, attempt)?,
            }
        }
    }

    /// Deposit funds into an active account.
    pub async fn deposit(&self, command: DepositCommand) -> Result<CommandReceipt, CommandError> {
        self.execute(command.account_id, |account| account.deposit(command.amount))
            .await
    }

    /// Withdraw funds; rejected when the balance does not cover the amount.
    pub async fn withdraw(&self, command: WithdrawCommand) -> Result<CommandReceipt, CommandError> {
        self.execute(command.account_id, |account| {
            account.withdraw(command.amount)
        })
        .await
    }

    /// Close an account with a zero balance.
    pub async fn close(&self, command: CloseAccountCommand) -> Result<CommandReceipt, CommandError> {
        self.execute(command.account_id, |account| account.close())
            .await
    }

    /// Shared pipeline for commands against an existing aggregate.
    async fn execute<F>(&self, account_id: Uuid, decide: F) -> Result<CommandReceipt, CommandError>
    where
        F: Fn(&Account) -> Result<AccountEvent, DomainError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let history = self.log.read_stream(account_id).await?;
            let account = Account::load_from_history(&history)
                .ok_or(DomainError::AccountNotFound { account_id })?;

            let event = decide(&account)?;
            let envelope = EventEnvelope::for_account(account_id, account.version() + 1, event);
            let event_id = envelope.event_id;
            let version = envelope.version;
            let payload = envelope.payload.clone();

            match self.log.append_atomic(vec![envelope]).await {
                Ok(()) => {
                    let account = account.apply(payload);
                    return Ok(CommandReceipt {
                        account_id,
                        event_id,
                        version,
                        balance: account.balance().value(),
                    });
                }
                Err(error) => self.handle_append_error(error, attempt)?,
            }
        }
    }

    /// Conflicts are retried (by looping); everything else surfaces.
    fn handle_append_error(&self, error: EventLogError, attempt: u32) -> Result<(), CommandError> {
        match error {
            EventLogError::Conflict { aggregate_id, .. } if attempt < self.retry_max => {
                tracing::warn!(
                    %aggregate_id,
                    attempt,
                    retry_max = self.retry_max,
                    "append conflict, retrying from reconstitution"
                );
                Ok(())
            }
            EventLogError::Conflict { .. } => Err(CommandError::Conflict { attempts: attempt }),
            other => Err(other.into()),
        }
    }
}
