//! Repair of settlements whose final commit never landed.
//!
//! A reservation older than the stale threshold means the process died or
//! the chain outcome was unknown. The escrow contract is the source of
//! truth: the local row is brought in line with it. Chain writes are never
//! retried here.

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::timeout::refund_actions;
use super::{chain_events, Lifecycle, SettlementKind};
use crate::chain::EscrowState;
use crate::db::{now_ms, Commit, NewEvent, ProofVerdict};
use crate::error::LifecycleResult;
use crate::types::{EventAction, Task, TaskAction, TaskStatus, VerificationStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Escrow exists on chain; recorded with a RECONCILE annotation.
    FundRecorded,
    /// Escrow was released on chain; VERIFY, PAY and CLOSE committed.
    ReleaseCommitted,
    /// Escrow was refunded on chain; the refund chain committed.
    RefundCommitted,
    /// Chain unchanged; the reservation was dropped so the operation can be retried.
    ReservationCleared,
    NeedsAttention { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileAction {
    pub task_id: String,
    pub settlement: Option<String>,
    pub status: TaskStatus,
    pub escrow_state: Option<EscrowState>,
    pub applied: bool,
    #[serde(flatten)]
    pub outcome: ReconcileOutcome,
}

enum Plan {
    Clear { clear_deposit: bool },
    RecordFund,
    CommitRelease,
    CommitRefund,
    Manual(String),
}

impl Plan {
    fn outcome(&self) -> ReconcileOutcome {
        match self {
            Plan::Clear { .. } => ReconcileOutcome::ReservationCleared,
            Plan::RecordFund => ReconcileOutcome::FundRecorded,
            Plan::CommitRelease => ReconcileOutcome::ReleaseCommitted,
            Plan::CommitRefund => ReconcileOutcome::RefundCommitted,
            Plan::Manual(reason) => ReconcileOutcome::NeedsAttention {
                reason: reason.clone(),
            },
        }
    }
}

fn plan(kind: Option<SettlementKind>, state: EscrowState) -> Plan {
    use EscrowState as E;
    use SettlementKind as K;

    match (kind, state) {
        (Some(K::Fund), E::None) => Plan::Clear { clear_deposit: true },
        (Some(K::Fund), _) => Plan::RecordFund,
        (Some(K::Release), E::Released) => Plan::CommitRelease,
        (Some(K::Refund), E::Refunded) => Plan::CommitRefund,
        (Some(K::Release | K::Refund), E::None | E::Funded) => Plan::Clear {
            clear_deposit: false,
        },
        (Some(kind), state) => Plan::Manual(format!(
            "{} reservation but escrow is {:?} on chain",
            kind, state
        )),
        (None, _) => Plan::Manual("unrecognised reservation token".to_string()),
    }
}

fn reconciled(events: Vec<NewEvent>) -> Vec<NewEvent> {
    events
        .into_iter()
        .map(|e| e.with_metadata(json!({ "reconciled": true })))
        .collect()
}

impl Lifecycle {
    /// Reconcile every reservation older than the configured threshold.
    pub async fn reconcile(&self, dry_run: bool) -> LifecycleResult<Vec<ReconcileAction>> {
        self.reconcile_at(now_ms(), dry_run).await
    }

    pub async fn reconcile_at(
        &self,
        now: i64,
        dry_run: bool,
    ) -> LifecycleResult<Vec<ReconcileAction>> {
        let threshold = now - self.settings.stale_settlement_secs.saturating_mul(1000);
        let stale = self.db.stale_settlements(threshold)?;

        let mut actions = Vec::with_capacity(stale.len());
        for task in &stale {
            actions.push(self.reconcile_task(task, dry_run).await);
        }
        Ok(actions)
    }

    async fn reconcile_task(&self, task: &Task, dry_run: bool) -> ReconcileAction {
        let token = task.pending_settlement.clone().unwrap_or_default();
        let kind = SettlementKind::of_token(&token);

        let mut action = ReconcileAction {
            task_id: task.id.clone(),
            settlement: kind.map(|k| k.to_string()),
            status: task.status,
            escrow_state: None,
            applied: false,
            outcome: ReconcileOutcome::ReservationCleared,
        };

        let state = match self.escrow.escrow_details(&task.id).await {
            Ok(escrow) => escrow.map(|e| e.state).unwrap_or(EscrowState::None),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "reconcile: chain read failed");
                action.outcome = ReconcileOutcome::Failed {
                    error: e.to_string(),
                };
                return action;
            }
        };
        action.escrow_state = Some(state);

        let plan = plan(kind, state);
        action.outcome = plan.outcome();

        if dry_run || matches!(plan, Plan::Manual(_)) {
            return action;
        }

        match self.apply(task, &token, &plan) {
            Ok(()) => {
                action.applied = true;
                info!(
                    task_id = %task.id,
                    outcome = ?action.outcome,
                    "reconcile: repaired settlement"
                );
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "reconcile: repair failed");
                action.outcome = ReconcileOutcome::Failed {
                    error: e.to_string(),
                };
            }
        }
        action
    }

    fn apply(&self, task: &Task, token: &str, plan: &Plan) -> LifecycleResult<()> {
        let base = Commit::new(&task.id, task.status).reservation(Some(token));

        match plan {
            Plan::Clear { clear_deposit } => {
                self.db.release_settlement(&task.id, token, *clear_deposit)?;
            }
            Plan::RecordFund => {
                let event = NewEvent::annotation(EventAction::Reconcile, task.status)
                    .with_metadata(json!({
                        "repair": "fund",
                        "deposit_tx_hash": task.deposit_tx,
                    }));
                self.commit(base.event(event))?;
            }
            Plan::CommitRelease => {
                let events = chain_events(
                    task.status,
                    &[TaskAction::Verify, TaskAction::Pay, TaskAction::Close],
                )?;
                let mut commit = base.events(reconciled(events));
                if let Some(proof) = self.db.latest_proof(&task.id)? {
                    commit = commit.verdict(ProofVerdict {
                        proof_id: proof.id,
                        status: VerificationStatus::Approved,
                        notes: Some("reconciled from chain".to_string()),
                    });
                }
                self.commit(commit)?;
            }
            Plan::CommitRefund => {
                let events = chain_events(task.status, refund_actions(task.status))?;
                self.commit(base.events(reconciled(events)))?;
            }
            Plan::Manual(_) => {}
        }
        Ok(())
    }
}
