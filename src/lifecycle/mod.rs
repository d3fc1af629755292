//! Lifecycle orchestrator.
//!
//! Each operation loads a task, runs its transition chain through the state
//! machine, performs any escrow or eligibility call, and persists the new
//! status with its events through a single compare-and-swap commit.
//!
//! Money-moving operations first take a settlement reservation on the task
//! row. A definite failure releases it; a failure whose on-chain outcome is
//! unknown leaves it for [`Lifecycle::reconcile`].

mod audit;
mod funding;
mod matching;
mod posting;
mod proof;
mod reconcile;
mod timeout;

pub use audit::AuditReport;
pub use matching::{rank_providers, ProviderScorer};
pub use posting::PostTaskInput;
pub use proof::{SubmitProofInput, VerifyInput};
pub use reconcile::{ReconcileAction, ReconcileOutcome};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chain::{ChainError, EligibilityChecker, EscrowClient};
use crate::config::TasksConfig;
use crate::db::{Commit, CommitOutcome, Database, NewEvent, ReserveOutcome};
use crate::error::{ErrorCode, LifecycleError, LifecycleResult};
use crate::state_machine::transition;
use crate::types::{PollResult, Task, TaskAction, TaskDetail, TaskStatus};

/// The money-moving operation a reservation guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    Fund,
    Release,
    Refund,
}

impl SettlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementKind::Fund => "fund",
            SettlementKind::Release => "release",
            SettlementKind::Refund => "refund",
        }
    }

    fn new_token(&self) -> String {
        format!("{}:{}", self.as_str(), Uuid::new_v4())
    }

    /// Kind encoded in a reservation token.
    pub fn of_token(token: &str) -> Option<Self> {
        token.split_once(':').and_then(|(kind, _)| kind.parse().ok())
    }
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fund" => Ok(SettlementKind::Fund),
            "release" => Ok(SettlementKind::Release),
            "refund" => Ok(SettlementKind::Refund),
            _ => Err(()),
        }
    }
}

/// Failure inside a reserved settlement.
struct SettlementFailure {
    error: LifecycleError,
    /// The chain may have applied the write.
    ambiguous: bool,
}

impl SettlementFailure {
    fn ambiguous(error: impl Into<LifecycleError>) -> Self {
        Self {
            error: error.into(),
            ambiguous: true,
        }
    }
}

impl From<LifecycleError> for SettlementFailure {
    fn from(error: LifecycleError) -> Self {
        Self {
            error,
            ambiguous: false,
        }
    }
}

impl From<ChainError> for SettlementFailure {
    fn from(err: ChainError) -> Self {
        Self {
            ambiguous: err.is_ambiguous(),
            error: err.into(),
        }
    }
}

/// Orchestrates every task status change.
#[derive(Clone)]
pub struct Lifecycle {
    db: Database,
    escrow: Arc<dyn EscrowClient>,
    eligibility: EligibilityChecker,
    settings: TasksConfig,
}

impl Lifecycle {
    pub fn new(
        db: Database,
        escrow: Arc<dyn EscrowClient>,
        eligibility: EligibilityChecker,
        settings: TasksConfig,
    ) -> Self {
        Self {
            db,
            escrow,
            eligibility,
            settings,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &TasksConfig {
        &self.settings
    }

    /// Task by id, or `TaskNotFound`.
    pub fn load(&self, task_id: &str) -> LifecycleResult<Task> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| LifecycleError::task_not_found(task_id))
    }

    /// Task with its full event log and current proof.
    pub fn get_detail(&self, task_id: &str) -> LifecycleResult<TaskDetail> {
        let task = self.load(task_id)?;
        let events = self.db.task_events(task_id)?;
        let proof = self.db.latest_proof(task_id)?;
        Ok(TaskDetail {
            task,
            events,
            proof,
        })
    }

    pub fn list(&self, status: Option<TaskStatus>) -> LifecycleResult<Vec<Task>> {
        Ok(self.db.list_tasks(status)?)
    }

    /// Readiness check against a target status.
    pub fn poll(&self, task_id: &str, target: TaskStatus) -> LifecycleResult<PollResult> {
        let task = self.load(task_id)?;
        if task.status == target {
            Ok(PollResult::Ready {
                ready: true,
                task: Box::new(task),
            })
        } else {
            Ok(PollResult::Pending {
                ready: false,
                current_status: task.status,
            })
        }
    }

    /// Commit, turning a lost compare-and-swap into a conflict.
    fn commit(&self, commit: Commit<'_>) -> LifecycleResult<Task> {
        let task_id = commit.task_id;
        let expected = commit.expected;

        match self.db.commit(commit)? {
            CommitOutcome::Committed(task) => Ok(task),
            CommitOutcome::Stale => Err(self.stale_error(task_id, expected)),
        }
    }

    fn stale_error(&self, task_id: &str, expected: TaskStatus) -> LifecycleError {
        match self.db.get_task(task_id) {
            Ok(Some(task)) if task.pending_settlement.is_some() => LifecycleError::conflict(
                ErrorCode::SettlementInProgress,
                format!("Task {} has a settlement in progress", task_id),
            ),
            Ok(Some(task)) => LifecycleError::stale(task_id, expected)
                .with_details(format!("current status {}", task.status)),
            _ => LifecycleError::stale(task_id, expected),
        }
    }

    /// Take a reservation, or explain why it cannot be taken.
    fn reserve(
        &self,
        task: &Task,
        kind: SettlementKind,
        deposit_tx: Option<&str>,
    ) -> LifecycleResult<String> {
        let token = kind.new_token();
        match self
            .db
            .reserve_settlement(&task.id, task.status, &token, deposit_tx)?
        {
            ReserveOutcome::Reserved => Ok(token),
            ReserveOutcome::Stale => Err(self.stale_error(&task.id, task.status)),
            ReserveOutcome::DepositInUse => Err(LifecycleError::conflict(
                ErrorCode::DepositAlreadyUsed,
                "Deposit transaction already funds another task",
            )
            .with_field("depositTxHash")),
        }
    }

    /// Release the reservation on a definite failure; keep it when the chain
    /// outcome is unknown.
    fn finish_settlement(
        &self,
        task_id: &str,
        token: &str,
        clear_deposit: bool,
        result: Result<Task, SettlementFailure>,
    ) -> LifecycleResult<Task> {
        match result {
            Ok(task) => Ok(task),
            Err(failure) if failure.ambiguous => {
                warn!(
                    task_id,
                    token,
                    error = %failure.error,
                    "settlement outcome unknown, reservation kept for reconciliation"
                );
                Err(failure.error)
            }
            Err(failure) => {
                if let Err(e) = self.db.release_settlement(task_id, token, clear_deposit) {
                    error!(task_id, token, error = %e, "failed to release settlement reservation");
                }
                Err(failure.error)
            }
        }
    }
}

/// Run `actions` in sequence from `start`, producing one event per step.
/// The first invalid step aborts the whole chain.
fn chain_events(start: TaskStatus, actions: &[TaskAction]) -> LifecycleResult<Vec<NewEvent>> {
    let mut status = start;
    let mut events = Vec::with_capacity(actions.len());

    for &action in actions {
        let next = transition(status, action)?;
        events.push(NewEvent::transition(action, status, next));
        status = next;
    }

    Ok(events)
}

fn log_transitions(task: &Task, events: &[NewEvent]) {
    for event in events {
        info!(
            task_id = %task.id,
            action = %event.action,
            from = %event.from,
            to = %event.to,
            tx_hash = event.tx_hash.as_deref().unwrap_or(""),
            "task transition"
        );
    }
}

/// Validate a `0x`-prefixed 32-byte transaction hash.
fn parse_tx_hash(field: &str, value: Option<&str>) -> LifecycleResult<String> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LifecycleError::missing_field(field))?;

    match crate::hashing::parse_hex32(&value.to_ascii_lowercase()) {
        Some(_) => Ok(value.to_ascii_lowercase()),
        None => Err(LifecycleError::invalid_value(
            field,
            format!("{} must be a 0x-prefixed 32-byte hex hash", field),
        )),
    }
}
