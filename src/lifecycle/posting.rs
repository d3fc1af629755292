//! Task creation and the human claim path.

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{chain_events, log_transitions, Lifecycle};
use crate::chain::{normalize_address, to_wei};
use crate::db::{Commit, NewTask, TaskPatch};
use crate::error::{ErrorCode, LifecycleError, LifecycleResult};
use crate::hashing::{compute_task_hash, TaskHashInput};
use crate::types::{Task, TaskAction, TaskTarget};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostTaskInput {
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub budget_amount: Option<f64>,
    #[serde(default)]
    pub sla_seconds: Option<i64>,
    #[serde(default)]
    pub urgent: Option<bool>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub requester_address: Option<String>,
    #[serde(default)]
    pub target: Option<TaskTarget>,
}

fn required_text(field: &str, value: Option<&str>) -> LifecycleResult<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| LifecycleError::missing_field(field))
}

pub(super) fn parse_address(field: &str, value: &str) -> LifecycleResult<String> {
    normalize_address(value)
        .map_err(|_| LifecycleError::invalid_value(field, format!("{} is not a valid address", field)))
}

impl Lifecycle {
    /// Create a task in POSTED with its task hash.
    pub fn post_task(&self, input: PostTaskInput) -> LifecycleResult<Task> {
        let capability = required_text("capability", input.capability.as_deref())?;
        let goal = required_text("goal", input.goal.as_deref())?;

        let budget_amount = input.budget_amount.unwrap_or(0.0);
        if !budget_amount.is_finite() || budget_amount < 0.0 || to_wei(budget_amount).is_none() {
            return Err(LifecycleError::invalid_value(
                "budgetAmount",
                "budgetAmount must be a non-negative number",
            ));
        }

        let sla_seconds = input.sla_seconds.unwrap_or(self.settings.default_sla_seconds);
        if sla_seconds <= 0 {
            return Err(LifecycleError::invalid_value(
                "slaSeconds",
                "slaSeconds must be positive",
            ));
        }

        let currency = input
            .currency
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.settings.default_currency.clone());

        let requester_address = input
            .requester_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|a| parse_address("requesterAddress", a))
            .transpose()?;

        let urgent = input.urgent.unwrap_or(false);

        let task_hash = compute_task_hash(&TaskHashInput {
            capability: &capability,
            goal: &goal,
            budget_amount,
            currency: &currency,
            sla_seconds,
            urgent,
        });

        let new = NewTask {
            id: Uuid::now_v7().to_string(),
            target: input.target.unwrap_or_default(),
            min_stake: budget_amount * self.settings.min_stake_multiplier,
            capability_id: capability,
            goal,
            budget_amount,
            currency,
            sla_seconds,
            urgent,
            task_hash,
            requester_address,
        };

        let task = self.db.insert_task(&new)?;
        info!(
            task_id = %task.id,
            capability = %task.capability_id,
            budget = task.budget_amount,
            task_hash = %task.task_hash,
            "task posted"
        );
        Ok(task)
    }

    /// Direct assignment to a human: POSTED -> IN_PROGRESS.
    pub fn claim(&self, task_id: &str, wallet_address: Option<&str>) -> LifecycleResult<Task> {
        let wallet = required_text("walletAddress", wallet_address)?;
        let wallet = parse_address("walletAddress", &wallet)?;

        let task = self.load(task_id)?;
        if task.target != TaskTarget::Human {
            return Err(LifecycleError::conflict(
                ErrorCode::TargetMismatch,
                format!("Task {} is not open to human claims", task_id),
            ));
        }

        let events = chain_events(task.status, &[TaskAction::Claim])?;
        log_transitions(&task, &events);

        self.commit(
            Commit::new(&task.id, task.status)
                .events(events)
                .patch(TaskPatch {
                    claimed_by: Some(wallet),
                    ..Default::default()
                }),
        )
    }
}
