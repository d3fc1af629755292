//! Event-log replay audit.

use serde::Serialize;

use super::Lifecycle;
use crate::error::LifecycleResult;
use crate::state_machine::replay;
use crate::types::{Task, TaskStatus};

/// Replay result for one task.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub task_id: String,
    pub stored_status: TaskStatus,
    pub replayed_status: Option<TaskStatus>,
    pub event_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.error.is_none() && self.replayed_status == Some(self.stored_status)
    }
}

impl Lifecycle {
    /// Replay one task's events and compare with its stored status.
    pub fn audit_task(&self, task_id: &str) -> LifecycleResult<AuditReport> {
        let task = self.load(task_id)?;
        self.audit(&task)
    }

    /// Audit every task, oldest first.
    pub fn audit_all(&self) -> LifecycleResult<Vec<AuditReport>> {
        self.db
            .get_all_tasks()?
            .iter()
            .map(|task| self.audit(task))
            .collect()
    }

    fn audit(&self, task: &Task) -> LifecycleResult<AuditReport> {
        let events = self.db.task_events(&task.id)?;

        let (replayed_status, error) = match replay(&events) {
            Ok(status) if status == task.status => (Some(status), None),
            Ok(status) => (
                Some(status),
                Some(format!(
                    "stored status {} but event log replays to {}",
                    task.status, status
                )),
            ),
            Err(e) => (None, Some(e.to_string())),
        };

        Ok(AuditReport {
            task_id: task.id.clone(),
            stored_status: task.status,
            replayed_status,
            event_count: events.len(),
            error,
        })
    }
}
