//! Task rows and compare-and-swap status commits.
//!
//! Every status change goes through [`Database::commit`], which updates the
//! row only if it still holds the expected status and reservation, and
//! appends the transition events in the same SQLite transaction.

use super::events::insert_event;
use super::proofs::{insert_proof_row, set_verdict_row, ProofVerdict};
use super::{enum_column, now_ms, Database};
use crate::types::{EventAction, Proof, Task, TaskAction, TaskStatus, TaskTarget};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

/// Fields of a task at creation.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub target: TaskTarget,
    pub capability_id: String,
    pub goal: String,
    pub budget_amount: f64,
    pub currency: String,
    pub sla_seconds: i64,
    pub urgent: bool,
    pub min_stake: f64,
    pub task_hash: String,
    pub requester_address: Option<String>,
}

/// An event row to append as part of a commit.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub action: EventAction,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub tx_hash: Option<String>,
    pub metadata: Option<Value>,
}

impl NewEvent {
    pub fn transition(action: TaskAction, from: TaskStatus, to: TaskStatus) -> Self {
        Self {
            action: EventAction::Transition(action),
            from,
            to,
            tx_hash: None,
            metadata: None,
        }
    }

    /// A settlement fact recorded without a status change.
    pub fn annotation(action: EventAction, status: TaskStatus) -> Self {
        Self {
            action,
            from: status,
            to: status,
            tx_hash: None,
            metadata: None,
        }
    }

    pub fn with_tx(mut self, tx_hash: Option<String>) -> Self {
        self.tx_hash = tx_hash;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Column updates applied with a commit. `None` leaves a column unchanged.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub provider_id: Option<String>,
    pub claimed_by: Option<String>,
    /// Written only when the task has no escrow tx, unless `replace_escrow_tx`.
    pub escrow_tx: Option<String>,
    pub replace_escrow_tx: bool,
    pub payout_tx: Option<String>,
    pub refund_tx: Option<String>,
    pub requester_address: Option<String>,
}

/// A status change plus everything written atomically with it.
#[derive(Debug, Clone)]
pub struct Commit<'a> {
    pub task_id: &'a str,
    pub expected: TaskStatus,
    pub reservation: Option<&'a str>,
    pub events: Vec<NewEvent>,
    pub patch: TaskPatch,
    pub new_proof: Option<Proof>,
    pub verdict: Option<ProofVerdict>,
}

impl<'a> Commit<'a> {
    pub fn new(task_id: &'a str, expected: TaskStatus) -> Self {
        Self {
            task_id,
            expected,
            reservation: None,
            events: Vec::new(),
            patch: TaskPatch::default(),
            new_proof: None,
            verdict: None,
        }
    }

    /// Require and clear this reservation token.
    pub fn reservation(mut self, token: Option<&'a str>) -> Self {
        self.reservation = token;
        self
    }

    pub fn event(mut self, event: NewEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = NewEvent>) -> Self {
        self.events.extend(events);
        self
    }

    pub fn patch(mut self, patch: TaskPatch) -> Self {
        self.patch = patch;
        self
    }

    pub fn proof(mut self, proof: Proof) -> Self {
        self.new_proof = Some(proof);
        self
    }

    pub fn verdict(mut self, verdict: ProofVerdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    fn final_status(&self) -> TaskStatus {
        self.events.last().map(|e| e.to).unwrap_or(self.expected)
    }

    fn check_chain(&self) -> Result<()> {
        let mut status = self.expected;
        for event in &self.events {
            if event.from != status {
                return Err(anyhow!(
                    "event chain for task {} breaks at {}: from {} but expected {}",
                    self.task_id,
                    event.action,
                    event.from,
                    status
                ));
            }
            status = event.to;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum CommitOutcome {
    Committed(Task),
    /// The row no longer matched the expected status or reservation.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    Stale,
    /// The deposit tx is already recorded against another task.
    DepositInUse,
}

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        status: enum_column(row.get("status")?)?,
        target: enum_column(row.get("target")?)?,
        capability_id: row.get("capability_id")?,
        goal: row.get("goal")?,
        budget_amount: row.get("budget_amount")?,
        currency: row.get("currency")?,
        sla_seconds: row.get("sla_seconds")?,
        urgent: row.get("urgent")?,
        min_stake: row.get("min_stake")?,
        task_hash: row.get("task_hash")?,
        provider_id: row.get("provider_id")?,
        claimed_by: row.get("claimed_by")?,
        escrow_tx: row.get("escrow_tx")?,
        deposit_tx: row.get("deposit_tx")?,
        payout_tx: row.get("payout_tx")?,
        refund_tx: row.get("refund_tx")?,
        requester_address: row.get("requester_address")?,
        pending_settlement: row.get("pending_settlement")?,
        pending_since: row.get("pending_since")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![task_id],
            parse_task_row,
        )
        .optional()?;
    Ok(task)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Database {
    /// Insert a task in POSTED together with its DRAFT -> POSTED event.
    pub fn insert_task(&self, new: &NewTask) -> Result<Task> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO tasks (id, status, target, capability_id, goal, budget_amount,
                    currency, sla_seconds, urgent, min_stake, task_hash, requester_address,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                params![
                    new.id,
                    TaskStatus::Posted.as_str(),
                    new.target.as_str(),
                    new.capability_id,
                    new.goal,
                    new.budget_amount,
                    new.currency,
                    new.sla_seconds,
                    new.urgent,
                    new.min_stake,
                    new.task_hash,
                    new.requester_address,
                    now,
                ],
            )?;

            let post = NewEvent::transition(TaskAction::Post, TaskStatus::Draft, TaskStatus::Posted)
                .with_metadata(serde_json::json!({ "task_hash": new.task_hash }));
            insert_event(&tx, &new.id, &post, now)?;

            tx.commit()?;

            get_task_internal(conn, &new.id)?
                .ok_or_else(|| anyhow!("Task {} vanished after insert", new.id))
        })
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// List tasks, newest first, optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let tasks = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at DESC, id",
                    )?;
                    stmt.query_map(params![status.as_str()], parse_task_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at DESC, id")?;
                    stmt.query_map([], parse_task_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(tasks)
        })
    }

    /// Every task, oldest first.
    pub fn get_all_tasks(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at, id")?;
            let tasks = stmt
                .query_map([], parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// Apply a commit if the row still matches its expected status and
    /// reservation. Status update, events and proof writes are one
    /// transaction.
    pub fn commit(&self, commit: Commit<'_>) -> Result<CommitOutcome> {
        commit.check_chain()?;

        let now = now_ms();
        let final_status = commit.final_status();
        let patch = &commit.patch;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let updated = tx.execute(
                "UPDATE tasks SET
                    status = ?1,
                    updated_at = ?2,
                    provider_id = COALESCE(?3, provider_id),
                    claimed_by = COALESCE(?4, claimed_by),
                    escrow_tx = CASE WHEN ?6 THEN COALESCE(?5, escrow_tx)
                                     ELSE COALESCE(escrow_tx, ?5) END,
                    payout_tx = COALESCE(?7, payout_tx),
                    refund_tx = COALESCE(?8, refund_tx),
                    requester_address = COALESCE(?9, requester_address),
                    pending_settlement = NULL,
                    pending_since = NULL
                 WHERE id = ?10 AND status = ?11
                   AND ((?12 IS NULL AND pending_settlement IS NULL) OR pending_settlement = ?12)",
                params![
                    final_status.as_str(),
                    now,
                    patch.provider_id,
                    patch.claimed_by,
                    patch.escrow_tx,
                    patch.replace_escrow_tx,
                    patch.payout_tx,
                    patch.refund_tx,
                    patch.requester_address,
                    commit.task_id,
                    commit.expected.as_str(),
                    commit.reservation,
                ],
            )?;

            if updated == 0 {
                // Dropping the transaction rolls it back.
                return Ok(CommitOutcome::Stale);
            }

            for event in &commit.events {
                insert_event(&tx, commit.task_id, event, now)?;
            }
            if let Some(proof) = &commit.new_proof {
                insert_proof_row(&tx, proof)?;
            }
            if let Some(verdict) = &commit.verdict {
                set_verdict_row(&tx, verdict)?;
            }

            tx.commit()?;

            let task = get_task_internal(conn, commit.task_id)?
                .ok_or_else(|| anyhow!("Task {} vanished during commit", commit.task_id))?;
            Ok(CommitOutcome::Committed(task))
        })
    }

    /// Take the settlement reservation on a task in `expected` status.
    ///
    /// With a `deposit_tx` the reservation also records the deposit and
    /// requires that no earlier deposit is recorded. A manually set escrow
    /// tx does not block it.
    pub fn reserve_settlement(
        &self,
        task_id: &str,
        expected: TaskStatus,
        token: &str,
        deposit_tx: Option<&str>,
    ) -> Result<ReserveOutcome> {
        let now = now_ms();

        self.with_conn(|conn| {
            let result = conn.execute(
                "UPDATE tasks SET pending_settlement = ?1, pending_since = ?2,
                    deposit_tx = COALESCE(?3, deposit_tx), updated_at = ?2
                 WHERE id = ?4 AND status = ?5 AND pending_settlement IS NULL
                   AND (?3 IS NULL OR deposit_tx IS NULL)",
                params![token, now, deposit_tx, task_id, expected.as_str()],
            );

            match result {
                Ok(0) => Ok(ReserveOutcome::Stale),
                Ok(_) => Ok(ReserveOutcome::Reserved),
                Err(e) if is_unique_violation(&e) => Ok(ReserveOutcome::DepositInUse),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Drop a reservation without changing status. Returns false if the
    /// token no longer held the row.
    pub fn release_settlement(&self, task_id: &str, token: &str, clear_deposit: bool) -> Result<bool> {
        let now = now_ms();

        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tasks SET pending_settlement = NULL, pending_since = NULL,
                    deposit_tx = CASE WHEN ?3 THEN NULL ELSE deposit_tx END,
                    updated_at = ?4
                 WHERE id = ?1 AND pending_settlement = ?2",
                params![task_id, token, clear_deposit, now],
            )?;
            Ok(updated > 0)
        })
    }

    /// Tasks whose reservation was taken at or before `older_than_ms`.
    pub fn stale_settlements(&self, older_than_ms: i64) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE pending_settlement IS NOT NULL AND pending_since <= ?1
                 ORDER BY pending_since",
            )?;
            let tasks = stmt
                .query_map(params![older_than_ms], parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }
}
