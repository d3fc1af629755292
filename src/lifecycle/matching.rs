//! Provider matching and acceptance.

use serde_json::json;
use std::cmp::Ordering;

use super::{chain_events, log_transitions, Lifecycle};
use crate::chain::to_wei;
use crate::db::{Commit, TaskPatch};
use crate::error::{ErrorCode, LifecycleError, LifecycleResult};
use crate::types::{Provider, Task, TaskAction};

/// Caller-supplied provider score; higher ranks first.
pub type ProviderScorer<'a> = dyn Fn(&Provider) -> f64 + 'a;

/// Order providers by a caller-supplied score. Ties keep their input order.
pub fn rank_providers(mut providers: Vec<Provider>, scorer: &ProviderScorer<'_>) -> Vec<Provider> {
    providers.sort_by(|a, b| {
        scorer(b)
            .partial_cmp(&scorer(a))
            .unwrap_or(Ordering::Equal)
    });
    providers
}

impl Lifecycle {
    fn min_stake_wei(&self, task: &Task) -> LifecycleResult<u128> {
        to_wei(task.min_stake).ok_or_else(|| {
            LifecycleError::internal(format!(
                "Task {} has an unrepresentable minimum stake {}",
                task.id, task.min_stake
            ))
        })
    }

    async fn ensure_eligible(&self, task: &Task, provider: &Provider) -> LifecycleResult<()> {
        let min_stake_wei = self.min_stake_wei(task)?;
        let eligible = self
            .eligibility
            .is_eligible(&provider.wallet_address, min_stake_wei)
            .await?;

        if !eligible {
            return Err(LifecycleError::conflict(
                ErrorCode::ProviderIneligible,
                "Provider does not meet minimum stake requirement",
            )
            .with_details(format!(
                "provider={} min_stake={}",
                provider.id, task.min_stake
            )));
        }
        Ok(())
    }

    fn load_provider(&self, provider_id: &str) -> LifecycleResult<Provider> {
        self.db
            .get_provider(provider_id)?
            .ok_or_else(|| LifecycleError::provider_not_found(provider_id))
    }

    /// POSTED -> MATCHED -> ESCROWED with an eligible provider.
    pub async fn match_provider(
        &self,
        task_id: &str,
        provider_id: Option<&str>,
        escrow_tx: Option<&str>,
    ) -> LifecycleResult<Task> {
        let provider_id = provider_id
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| LifecycleError::missing_field("providerId"))?;
        let escrow_tx = escrow_tx
            .map(|tx| super::parse_tx_hash("escrowTx", Some(tx)))
            .transpose()?;

        let task = self.load(task_id)?;
        let mut events = chain_events(task.status, &[TaskAction::Match, TaskAction::Escrow])?;

        let provider = self.load_provider(provider_id)?;
        self.ensure_eligible(&task, &provider).await?;

        events[0].metadata = Some(json!({ "provider_id": provider.id }));
        events[1].tx_hash = escrow_tx.clone();
        log_transitions(&task, &events);

        self.commit(
            Commit::new(&task.id, task.status)
                .events(events)
                .patch(TaskPatch {
                    provider_id: Some(provider.id),
                    escrow_tx,
                    ..Default::default()
                }),
        )
    }

    /// ESCROWED -> ACCEPTED -> IN_PROGRESS, re-checking the provider's stake.
    pub async fn accept(&self, task_id: &str) -> LifecycleResult<Task> {
        let task = self.load(task_id)?;
        let events = chain_events(task.status, &[TaskAction::Accept, TaskAction::Start])?;

        if let Some(provider_id) = &task.provider_id {
            let provider = self.load_provider(provider_id)?;
            self.ensure_eligible(&task, &provider).await?;
        }

        log_transitions(&task, &events);
        self.commit(Commit::new(&task.id, task.status).events(events))
    }
}
