//! Escrow funding from a verified requester deposit.

use serde_json::json;
use tracing::info;

use super::{parse_tx_hash, Lifecycle, SettlementFailure, SettlementKind};
use crate::chain::to_wei;
use crate::db::{Commit, NewEvent, TaskPatch};
use crate::error::{ErrorCode, LifecycleError, LifecycleResult};
use crate::types::{EventAction, Task, TaskStatus};

fn already_funded(task_id: &str) -> LifecycleError {
    LifecycleError::conflict(
        ErrorCode::EscrowAlreadyFunded,
        format!("Escrow already funded for task {}", task_id),
    )
}

impl Lifecycle {
    /// Verify the requester's deposit and create the forwarding escrow.
    /// Status stays POSTED; a FUND annotation records the escrow tx.
    pub async fn fund(&self, task_id: &str, deposit_tx: Option<&str>) -> LifecycleResult<Task> {
        let deposit_tx = parse_tx_hash("depositTxHash", deposit_tx)?;
        let task = self.load(task_id)?;

        if task.status != TaskStatus::Posted {
            return Err(LifecycleError::conflict(
                ErrorCode::InvalidTransition,
                format!("Task is not in POSTED status (current: {})", task.status),
            ));
        }
        if !task.has_budget() {
            return Err(LifecycleError::conflict(
                ErrorCode::NoBudget,
                "Task has no budget, escrow not needed",
            ));
        }
        // A settled deposit means a platform fund already landed. A manual
        // escrow tx alone is only a reference; the chain check below decides.
        let deposit_settled = task.deposit_tx.is_some() && task.pending_settlement.is_none();
        if deposit_settled {
            return Err(already_funded(task_id));
        }

        let amount_wei = to_wei(task.budget_amount).ok_or_else(|| {
            LifecycleError::internal(format!("Task {} budget is not representable", task_id))
        })?;

        let token = self.reserve(&task, SettlementKind::Fund, Some(&deposit_tx))?;
        let result = self
            .fund_reserved(&task, &token, &deposit_tx, amount_wei)
            .await;
        self.finish_settlement(&task.id, &token, true, result)
    }

    async fn fund_reserved(
        &self,
        task: &Task,
        token: &str,
        deposit_tx: &str,
        amount_wei: u128,
    ) -> Result<Task, SettlementFailure> {
        if self.escrow.escrow_exists(&task.id).await? {
            return Err(already_funded(&task.id).into());
        }

        let deposit = self.escrow.verify_deposit(deposit_tx, amount_wei).await?;
        if !deposit.valid {
            return Err(LifecycleError::new(
                ErrorCode::DepositInvalid,
                "Deposit verification failed: transaction must be successful, sent to the \
                 settlement address, and cover the full budget amount",
            )
            .with_field("depositTxHash")
            .into());
        }

        // Re-check as close to the write as possible.
        if self.escrow.escrow_exists(&task.id).await? {
            return Err(already_funded(&task.id).into());
        }

        let escrow_tx = self
            .escrow
            .create_escrow(&task.id, &task.task_hash, amount_wei)
            .await?;

        info!(
            task_id = %task.id,
            escrow_tx = %escrow_tx,
            deposit_tx,
            "escrow funded"
        );

        let event = NewEvent::annotation(EventAction::Fund, TaskStatus::Posted)
            .with_tx(Some(escrow_tx.clone()))
            .with_metadata(json!({
                "deposit_tx_hash": deposit_tx,
                "funder": deposit.payer,
            }));

        self.commit(
            Commit::new(&task.id, TaskStatus::Posted)
                .reservation(Some(token))
                .event(event)
                .patch(TaskPatch {
                    escrow_tx: Some(escrow_tx),
                    replace_escrow_tx: true,
                    requester_address: deposit.payer,
                    ..Default::default()
                }),
        )
        .map_err(SettlementFailure::ambiguous)
    }

    /// Record an escrow tx reference without a status change.
    pub fn set_escrow_tx(&self, task_id: &str, tx_hash: Option<&str>) -> LifecycleResult<Task> {
        let tx_hash = parse_tx_hash("txHash", tx_hash)?;
        let task = self.load(task_id)?;

        let event = NewEvent::annotation(EventAction::EscrowTx, task.status)
            .with_tx(Some(tx_hash.clone()))
            .with_metadata(json!({ "previous": task.escrow_tx }));

        info!(task_id, tx_hash = %tx_hash, "escrow tx set manually");

        self.commit(
            Commit::new(&task.id, task.status)
                .event(event)
                .patch(TaskPatch {
                    escrow_tx: Some(tx_hash),
                    replace_escrow_tx: true,
                    ..Default::default()
                }),
        )
    }
}
