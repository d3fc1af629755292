//! SLA expiry: TIMEOUT then REFUND.

use tracing::info;

use super::{chain_events, log_transitions, Lifecycle, SettlementFailure, SettlementKind};
use crate::chain::EscrowState;
use crate::db::{now_ms, Commit, NewEvent, TaskPatch};
use crate::error::{ErrorCode, LifecycleError, LifecycleResult};
use crate::types::{EventAction, Task, TaskAction, TaskStatus};

/// Transition chain that ends in REFUNDED from `status`.
pub(super) fn refund_actions(status: TaskStatus) -> &'static [TaskAction] {
    if status == TaskStatus::TimedOut {
        &[TaskAction::Refund]
    } else {
        &[TaskAction::Timeout, TaskAction::Refund]
    }
}

impl Lifecycle {
    pub async fn refund(&self, task_id: &str) -> LifecycleResult<Task> {
        self.refund_at(task_id, now_ms()).await
    }

    /// Refund as of `now` (milliseconds). Fails with a conflict before the
    /// SLA deadline. Refunds the on-chain escrow when it is still funded.
    pub async fn refund_at(&self, task_id: &str, now: i64) -> LifecycleResult<Task> {
        let task = self.load(task_id)?;

        let deadline = task.sla_deadline_ms();
        if now < deadline {
            let remaining_secs = (deadline - now + 999) / 1000;
            return Err(LifecycleError::conflict(
                ErrorCode::SlaNotExpired,
                format!("SLA has not expired yet. {}s remaining", remaining_secs),
            )
            .with_details(format!("deadline_ms={}", deadline)));
        }

        let events = chain_events(task.status, refund_actions(task.status))?;

        if !task.has_budget() {
            return self.commit_refund(&task, None, events, None);
        }

        let token = self.reserve(&task, SettlementKind::Refund, None)?;
        let result = self.refund_reserved(&task, &token, events).await;
        self.finish_settlement(&task.id, &token, false, result)
    }

    async fn refund_reserved(
        &self,
        task: &Task,
        token: &str,
        events: Vec<NewEvent>,
    ) -> Result<Task, SettlementFailure> {
        let escrow = self.escrow.escrow_details(&task.id).await?;
        let funded = escrow.is_some_and(|e| e.state == EscrowState::Funded);

        if !funded {
            return self
                .commit_refund(task, Some(token), events, None)
                .map_err(SettlementFailure::from);
        }

        let refund_tx = self.escrow.refund_escrow(&task.id).await?;
        info!(task_id = %task.id, refund_tx = %refund_tx, "escrow refunded");

        self.commit_refund(task, Some(token), events, Some(refund_tx))
            .map_err(SettlementFailure::ambiguous)
    }

    fn commit_refund(
        &self,
        task: &Task,
        token: Option<&str>,
        mut events: Vec<NewEvent>,
        refund_tx: Option<String>,
    ) -> LifecycleResult<Task> {
        if let Some(last) = events.last_mut() {
            if last.action == EventAction::Transition(TaskAction::Refund) {
                last.tx_hash = refund_tx.clone();
            }
        }
        log_transitions(task, &events);

        self.commit(
            Commit::new(&task.id, task.status)
                .reservation(token)
                .events(events)
                .patch(TaskPatch {
                    refund_tx,
                    ..Default::default()
                }),
        )
    }
}
