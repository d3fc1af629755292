//! Proof submission and verification.

use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{
    chain_events, log_transitions, parse_tx_hash, Lifecycle, SettlementFailure, SettlementKind,
};
use crate::chain::EscrowState;
use crate::db::{now_ms, Commit, NewEvent, ProofVerdict, TaskPatch};
use crate::error::{ErrorCode, LifecycleError, LifecycleResult};
use crate::hashing::compute_proof_hash;
use crate::types::{
    EventAction, Proof, ProofArtifact, Task, TaskAction, TaskStatus, VerificationStatus,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitProofInput {
    #[serde(default)]
    pub artifacts: Vec<ProofArtifact>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyInput {
    /// Defaults to approve.
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Recorded only when the platform performs no release itself.
    #[serde(default)]
    pub payout_tx: Option<String>,
}

fn no_proof(task_id: &str) -> LifecycleError {
    LifecycleError::conflict(
        ErrorCode::NoProof,
        format!("No proof submitted for task {}", task_id),
    )
}

impl Lifecycle {
    /// IN_PROGRESS -> PROOF_SUBMITTED, or PROOF_REJECTED -> PROOF_SUBMITTED
    /// on resubmission. Returns the task and the stored proof.
    pub fn submit_proof(
        &self,
        task_id: &str,
        input: SubmitProofInput,
    ) -> LifecycleResult<(Task, Proof)> {
        let notes = input.notes.unwrap_or_default();
        if input.artifacts.is_empty() && notes.trim().is_empty() {
            return Err(LifecycleError::new(
                ErrorCode::MissingRequiredField,
                "artifacts or notes are required",
            )
            .with_field("artifacts"));
        }
        for (i, artifact) in input.artifacts.iter().enumerate() {
            if artifact.kind.trim().is_empty() || artifact.value.trim().is_empty() {
                return Err(LifecycleError::invalid_value(
                    "artifacts",
                    format!("artifact {} needs a type and a value", i),
                ));
            }
        }

        let task = self.load(task_id)?;
        let action = if task.status == TaskStatus::ProofRejected {
            TaskAction::RetryProof
        } else {
            TaskAction::SubmitProof
        };
        let mut events = chain_events(task.status, &[action])?;

        let proof = Proof {
            id: Uuid::now_v7().to_string(),
            task_id: task.id.clone(),
            proof_hash: compute_proof_hash(&input.artifacts, &notes),
            artifacts: input.artifacts,
            notes,
            verification_status: VerificationStatus::Pending,
            verification_notes: None,
            created_at: now_ms(),
        };

        events[0].metadata = Some(json!({
            "proof_id": proof.id,
            "proof_hash": proof.proof_hash,
        }));
        log_transitions(&task, &events);

        let task = self.commit(
            Commit::new(&task.id, task.status)
                .events(events)
                .proof(proof.clone()),
        )?;
        Ok((task, proof))
    }

    /// Approve (VERIFY -> PAY -> CLOSE, releasing escrow when funded) or
    /// reject (REJECT_PROOF) the current proof.
    pub async fn verify(&self, task_id: &str, input: VerifyInput) -> LifecycleResult<Task> {
        let task = self.load(task_id)?;
        let notes = input.notes.unwrap_or_default();

        if !input.approved.unwrap_or(true) {
            return self.reject_proof(&task, notes);
        }

        let events = chain_events(
            task.status,
            &[TaskAction::Verify, TaskAction::Pay, TaskAction::Close],
        )?;
        let proof = self.db.latest_proof(&task.id)?.ok_or_else(|| no_proof(&task.id))?;
        let client_payout = input
            .payout_tx
            .as_deref()
            .map(|tx| parse_tx_hash("payoutTx", Some(tx)))
            .transpose()?;

        let verdict = ProofVerdict {
            proof_id: proof.id.clone(),
            status: VerificationStatus::Approved,
            notes: Some(notes),
        };

        if !task.has_budget() {
            return self.commit_payout(&task, None, events, verdict, client_payout, false);
        }

        let payee = self.resolve_payee(&task)?;
        let token = self.reserve(&task, SettlementKind::Release, None)?;
        let result = self
            .release_reserved(&task, &token, &proof, payee, events, verdict, client_payout)
            .await;
        self.finish_settlement(&task.id, &token, false, result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn release_reserved(
        &self,
        task: &Task,
        token: &str,
        proof: &Proof,
        payee: Option<String>,
        events: Vec<NewEvent>,
        verdict: ProofVerdict,
        client_payout: Option<String>,
    ) -> Result<Task, SettlementFailure> {
        let escrow = self.escrow.escrow_details(&task.id).await?;
        let funded = escrow.is_some_and(|e| e.state == EscrowState::Funded);

        if !funded {
            return self
                .commit_payout(task, Some(token), events, verdict, client_payout, false)
                .map_err(SettlementFailure::from);
        }

        let payee = payee.ok_or_else(|| {
            LifecycleError::conflict(
                ErrorCode::NoPayee,
                format!("Task {} has no provider wallet or claimant to pay", task.id),
            )
        })?;

        let payout_tx = self
            .escrow
            .release_escrow(&task.id, &payee, &proof.proof_hash)
            .await?;
        info!(task_id = %task.id, payee = %payee, payout_tx = %payout_tx, "escrow released");

        self.commit_payout(task, Some(token), events, verdict, Some(payout_tx), true)
            .map_err(SettlementFailure::ambiguous)
    }

    fn commit_payout(
        &self,
        task: &Task,
        token: Option<&str>,
        mut events: Vec<NewEvent>,
        verdict: ProofVerdict,
        payout_tx: Option<String>,
        released: bool,
    ) -> LifecycleResult<Task> {
        for event in events.iter_mut() {
            if event.action == EventAction::Transition(TaskAction::Pay) {
                event.tx_hash = payout_tx.clone();
                event.metadata = Some(json!({ "released_by_platform": released }));
            }
        }
        log_transitions(task, &events);

        self.commit(
            Commit::new(&task.id, task.status)
                .reservation(token)
                .events(events)
                .verdict(verdict)
                .patch(TaskPatch {
                    payout_tx,
                    ..Default::default()
                }),
        )
    }

    /// Matched provider's wallet, else the human claimant.
    fn resolve_payee(&self, task: &Task) -> LifecycleResult<Option<String>> {
        if let Some(provider_id) = &task.provider_id {
            if let Some(provider) = self.db.get_provider(provider_id)? {
                return Ok(Some(provider.wallet_address));
            }
        }
        Ok(task.claimed_by.clone())
    }

    fn reject_proof(&self, task: &Task, notes: String) -> LifecycleResult<Task> {
        let mut events = chain_events(task.status, &[TaskAction::RejectProof])?;
        let proof = self.db.latest_proof(&task.id)?.ok_or_else(|| no_proof(&task.id))?;

        events[0].metadata = Some(json!({ "notes": notes, "proof_id": proof.id }));
        log_transitions(task, &events);

        self.commit(
            Commit::new(&task.id, task.status)
                .events(events)
                .verdict(ProofVerdict {
                    proof_id: proof.id,
                    status: VerificationStatus::Rejected,
                    notes: Some(notes),
                }),
        )
    }
}
