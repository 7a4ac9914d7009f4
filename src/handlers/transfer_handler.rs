//! Transfer handler
//!
//! Moves funds between two accounts. A transfer is never a stored event of
//! its own: it is a withdrawal on the source and a deposit on the
//! destination, built from independently re-read histories and committed
//! together in one atomic batch. Either both land or neither does.

use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::{Account, Aggregate};
use crate::domain::{DomainError, EventEnvelope};
use crate::event_log::{EventLog, EventLogError};

use super::commands::{TransferCommand, TransferReceipt};
use super::CommandError;

/// Handler for atomic two-account transfers
pub struct TransferHandler {
    log: Arc<dyn EventLog>,
    retry_max: u32,
}

impl TransferHandler {
    pub fn new(log: Arc<dyn EventLog>, retry_max: u32) -> Self {
        Self {
            log,
            retry_max: retry_max.max(1),
        }
    }

    pub async fn execute(&self, command: TransferCommand) -> Result<TransferReceipt, CommandError> {
        if command.from_account_id == command.to_account_id {
            return Err(DomainError::SameAccountTransfer {
                account_id: command.from_account_id,
            }
            .into());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let from = self.load(command.from_account_id).await?;
            let to = self.load(command.to_account_id).await?;

            // Both legs validate against freshly read state; a conflict on
            // either aggregate restarts the whole pipeline.
            let withdrawal = from.withdraw(command.amount)?;
            let deposit = to.deposit(command.amount)?;

            let from_version = from.version() + 1;
            let to_version = to.version() + 1;
            let batch = vec![
                EventEnvelope::for_account(command.from_account_id, from_version, withdrawal),
                EventEnvelope::for_account(command.to_account_id, to_version, deposit),
            ];

            match self.log.append_atomic(batch).await {
                Ok(()) => {
                    return Ok(TransferReceipt {
                        from_account_id: command.from_account_id,
                        to_account_id: command.to_account_id,
                        amount: command.amount,
                        from_version,
                        to_version,
                    })
                }
                Err(EventLogError::Conflict { aggregate_id, .. }) if attempt < self.retry_max => {
                    tracing::warn!(
                        %aggregate_id,
                        attempt,
                        retry_max = self.retry_max,
                        "transfer append conflict, retrying from reconstitution"
                    );
                }
                Err(EventLogError::Conflict { .. }) => {
                    return Err(CommandError::Conflict { attempts: attempt })
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    async fn load(&self, account_id: Uuid) -> Result<Account, CommandError> {
        let history = self.log.read_stream(account_id).await?;
        Account::load_from_history(&history)
            .ok_or_else(|| DomainError::AccountNotFound { account_id }.into())
    }
}
