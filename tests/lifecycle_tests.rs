//! Integration tests for the task lifecycle.
//!
//! Every test runs against an in-memory SQLite database and the in-process
//! ledger, so chain calls can be observed and faults injected.

use std::sync::Arc;
use task_settlement::chain::memory::LedgerCall;
use task_settlement::chain::{EligibilityChecker, EscrowState, MemoryLedger, StakeRegistry};
use task_settlement::config::TasksConfig;
use task_settlement::db::{now_ms, Database, NewProvider};
use task_settlement::error::ErrorCode;
use task_settlement::lifecycle::{
    Lifecycle, PostTaskInput, ReconcileOutcome, SubmitProofInput, VerifyInput,
};
use task_settlement::types::{
    EventAction, PollResult, ProofArtifact, Task, TaskAction, TaskStatus, TaskTarget,
    VerificationStatus,
};

const WEI: u128 = 1_000_000_000_000_000_000;
const REQUESTER: &str = "0x00000000000000000000000000000000000000a1";
const PROVIDER_WALLET: &str = "0x00000000000000000000000000000000000000b2";
const CLAIMANT: &str = "0x00000000000000000000000000000000000000c3";

struct Harness {
    lifecycle: Lifecycle,
    ledger: Arc<MemoryLedger>,
}

/// Helper to build a lifecycle over a fresh database and ledger.
fn setup() -> Harness {
    let db = Database::open_in_memory().expect("Failed to create in-memory database");
    let ledger = Arc::new(MemoryLedger::default());
    let registry: Arc<dyn StakeRegistry> = ledger.clone();
    let lifecycle = Lifecycle::new(
        db,
        ledger.clone(),
        EligibilityChecker::new(Some(registry), false),
        TasksConfig::default(),
    );
    Harness { lifecycle, ledger }
}

impl Harness {
    fn post(&self, budget: f64, target: TaskTarget) -> Task {
        self.lifecycle
            .post_task(PostTaskInput {
                capability: Some("restaurant_booking".to_string()),
                goal: Some("Book a table for two at 7pm".to_string()),
                budget_amount: Some(budget),
                sla_seconds: Some(600),
                target: Some(target),
                ..Default::default()
            })
            .expect("Failed to post task")
    }

    /// Register a provider staked for tasks up to `budget`.
    fn staked_provider(&self, budget: u128) -> String {
        let provider = self
            .lifecycle
            .db()
            .insert_provider(&NewProvider {
                name: "Table Finder".to_string(),
                wallet_address: PROVIDER_WALLET.to_string(),
                capability_ids: vec!["restaurant_booking".to_string()],
                price: 5.0,
                eta_minutes: 30,
                rating: 4.8,
                success_rate: 0.95,
                stake_amount: 100.0,
            })
            .expect("Failed to insert provider");
        self.ledger.set_stake(PROVIDER_WALLET, budget * 2 * WEI);
        provider.id
    }

    async fn fund(&self, task: &Task, amount_wei: u128) -> Task {
        let deposit = self.ledger.record_deposit(REQUESTER, amount_wei);
        self.lifecycle
            .fund(&task.id, Some(&deposit))
            .await
            .expect("Failed to fund task")
    }

    fn submit(&self, task_id: &str, code: &str) -> Task {
        let (task, _) = self
            .lifecycle
            .submit_proof(
                task_id,
                SubmitProofInput {
                    artifacts: vec![ProofArtifact {
                        kind: "confirmation_code".to_string(),
                        value: code.to_string(),
                        label: None,
                    }],
                    notes: Some("Booked".to_string()),
                },
            )
            .expect("Failed to submit proof");
        task
    }

    fn actions(&self, task_id: &str) -> Vec<EventAction> {
        self.lifecycle
            .db()
            .task_events(task_id)
            .expect("Failed to load events")
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    fn assert_consistent(&self, task_id: &str) {
        let report = self
            .lifecycle
            .audit_task(task_id)
            .expect("Failed to audit task");
        assert!(report.is_consistent(), "audit diverged: {:?}", report);
    }
}

fn approve() -> VerifyInput {
    VerifyInput {
        approved: Some(true),
        notes: Some("looks good".to_string()),
        payout_tx: None,
    }
}

fn t(action: TaskAction) -> EventAction {
    EventAction::Transition(action)
}

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn funded_agent_task_settles_to_provider() {
        let h = setup();
        let task = h.post(10.0, TaskTarget::Agent);
        let provider_id = h.staked_provider(10);

        let task = h.fund(&task, 10 * WEI).await;
        assert_eq!(task.status, TaskStatus::Posted);
        assert!(task.escrow_tx.is_some());
        assert_eq!(task.requester_address.as_deref(), Some(REQUESTER));

        let task = h
            .lifecycle
            .match_provider(&task.id, Some(&provider_id), None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Escrowed);
        assert_eq!(task.provider_id.as_deref(), Some(provider_id.as_str()));

        let task = h.lifecycle.accept(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        let task = h.submit(&task.id, "ABC123");
        assert_eq!(task.status, TaskStatus::ProofSubmitted);

        let task = h.lifecycle.verify(&task.id, approve()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Closed);
        assert!(task.payout_tx.is_some());
        assert!(task.pending_settlement.is_none());

        let escrow = h.ledger.escrow(&task.id).unwrap();
        assert_eq!(escrow.state, EscrowState::Released);
        assert_eq!(escrow.provider, PROVIDER_WALLET);

        assert_eq!(
            h.actions(&task.id),
            vec![
                t(TaskAction::Post),
                EventAction::Fund,
                t(TaskAction::Match),
                t(TaskAction::Escrow),
                t(TaskAction::Accept),
                t(TaskAction::Start),
                t(TaskAction::SubmitProof),
                t(TaskAction::Verify),
                t(TaskAction::Pay),
                t(TaskAction::Close),
            ]
        );

        let proof = h.lifecycle.db().latest_proof(&task.id).unwrap().unwrap();
        assert_eq!(proof.verification_status, VerificationStatus::Approved);
        h.assert_consistent(&task.id);
    }

    #[tokio::test]
    async fn unbudgeted_human_claim_closes_without_chain_writes() {
        let h = setup();
        let task = h.post(0.0, TaskTarget::Human);

        let task = h.lifecycle.claim(&task.id, Some(CLAIMANT)).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.claimed_by.as_deref(), Some(CLAIMANT));

        h.submit(&task.id, "DONE");
        let task = h.lifecycle.verify(&task.id, approve()).await.unwrap();

        assert_eq!(task.status, TaskStatus::Closed);
        assert!(task.payout_tx.is_none());
        assert!(h.ledger.write_calls().is_empty());
        h.assert_consistent(&task.id);
    }

    #[tokio::test]
    async fn unbudgeted_agent_task_matches_unstaked_provider_and_closes() {
        let h = setup();
        let task = h.post(0.0, TaskTarget::Agent);
        assert_eq!(task.min_stake, 0.0);

        let provider = h
            .lifecycle
            .db()
            .insert_provider(&NewProvider {
                name: "Volunteer".to_string(),
                wallet_address: PROVIDER_WALLET.to_string(),
                capability_ids: vec!["restaurant_booking".to_string()],
                ..Default::default()
            })
            .unwrap();

        let task = h
            .lifecycle
            .match_provider(&task.id, Some(&provider.id), None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Escrowed);
        assert!(task.escrow_tx.is_none());

        let task = h.lifecycle.accept(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        h.submit(&task.id, "DONE");
        let task = h.lifecycle.verify(&task.id, approve()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Closed);
        assert!(task.payout_tx.is_none());
        assert!(h.ledger.write_calls().is_empty());
        assert!(h.ledger.escrow(&task.id).is_none());

        let eligibility_checks = h
            .ledger
            .calls()
            .into_iter()
            .filter(|call| matches!(call, LedgerCall::IsEligible { min_stake_wei: 0, .. }))
            .count();
        assert_eq!(eligibility_checks, 2);

        assert_eq!(
            h.actions(&task.id),
            vec![
                t(TaskAction::Post),
                t(TaskAction::Match),
                t(TaskAction::Escrow),
                t(TaskAction::Accept),
                t(TaskAction::Start),
                t(TaskAction::SubmitProof),
                t(TaskAction::Verify),
                t(TaskAction::Pay),
                t(TaskAction::Close),
            ]
        );
        h.assert_consistent(&task.id);
    }

    #[tokio::test]
    async fn expired_task_is_refunded_on_chain() {
        let h = setup();
        let task = h.post(10.0, TaskTarget::Agent);
        let provider_id = h.staked_provider(10);
        let task = h.fund(&task, 10 * WEI).await;
        h.lifecycle
            .match_provider(&task.id, Some(&provider_id), None)
            .await
            .unwrap();
        h.lifecycle.accept(&task.id).await.unwrap();

        let err = h
            .lifecycle
            .refund_at(&task.id, task.created_at + 1_000)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SlaNotExpired);
        assert_eq!(err.http_status(), 409);

        let deadline = task.sla_deadline_ms();
        let task = h.lifecycle.refund_at(&task.id, deadline).await.unwrap();
        assert_eq!(task.status, TaskStatus::Refunded);
        assert!(task.refund_tx.is_some());
        assert_eq!(
            h.ledger.escrow(&task.id).unwrap().state,
            EscrowState::Refunded
        );

        let events = h.lifecycle.db().task_events(&task.id).unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.action, t(TaskAction::Refund));
        assert_eq!(last.tx_hash, task.refund_tx);
        h.assert_consistent(&task.id);
    }

    #[tokio::test]
    async fn rejected_proof_can_be_resubmitted_and_paid_to_claimant() {
        let h = setup();
        let task = h.post(5.0, TaskTarget::Human);
        let task = h.fund(&task, 5 * WEI).await;
        h.lifecycle.claim(&task.id, Some(CLAIMANT)).unwrap();
        h.submit(&task.id, "WRONG");

        let task = h
            .lifecycle
            .verify(
                &task.id,
                VerifyInput {
                    approved: Some(false),
                    notes: Some("code does not match".to_string()),
                    payout_tx: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::ProofRejected);
        let rejected = h.lifecycle.db().latest_proof(&task.id).unwrap().unwrap();
        assert_eq!(rejected.verification_status, VerificationStatus::Rejected);

        let task = h.submit(&task.id, "RIGHT");
        assert_eq!(task.status, TaskStatus::ProofSubmitted);
        assert!(h.actions(&task.id).contains(&t(TaskAction::RetryProof)));

        let task = h.lifecycle.verify(&task.id, approve()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Closed);
        assert_eq!(h.ledger.escrow(&task.id).unwrap().provider, CLAIMANT);
        assert_eq!(
            h.lifecycle.db().task_proofs(&task.id).unwrap().len(),
            2
        );
        h.assert_consistent(&task.id);
    }
}

mod funding_tests {
    use super::*;

    #[tokio::test]
    async fn second_fund_is_rejected_without_a_second_escrow() {
        let h = setup();
        let task = h.post(10.0, TaskTarget::Agent);
        h.fund(&task, 10 * WEI).await;

        let another = h.ledger.record_deposit(REQUESTER, 10 * WEI);
        let err = h.lifecycle.fund(&task.id, Some(&another)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EscrowAlreadyFunded);
        assert_eq!(err.http_status(), 409);

        let creates = h
            .ledger
            .write_calls()
            .into_iter()
            .filter(|c| matches!(c, LedgerCall::CreateEscrow { .. }))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn concurrent_funds_create_one_escrow() {
        let h = setup();
        let task = h.post(10.0, TaskTarget::Agent);
        let first = h.ledger.record_deposit(REQUESTER, 10 * WEI);
        let second = h.ledger.record_deposit(REQUESTER, 10 * WEI);

        let (a, b) = tokio::join!(
            h.lifecycle.fund(&task.id, Some(&first)),
            h.lifecycle.fund(&task.id, Some(&second)),
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let err = a.err().or(b.err()).unwrap();
        assert_eq!(err.http_status(), 409);
        assert_eq!(h.ledger.write_calls().len(), 1);
    }

    #[tokio::test]
    async fn deposit_cannot_fund_two_tasks() {
        let h = setup();
        let first = h.post(10.0, TaskTarget::Agent);
        let second = h.post(10.0, TaskTarget::Agent);
        let deposit = h.ledger.record_deposit(REQUESTER, 10 * WEI);

        h.lifecycle.fund(&first.id, Some(&deposit)).await.unwrap();
        let err = h
            .lifecycle
            .fund(&second.id, Some(&deposit))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DepositAlreadyUsed);
        assert!(h.ledger.escrow(&second.id).is_none());
    }

    #[tokio::test]
    async fn short_deposit_is_invalid_and_releases_reservation() {
        let h = setup();
        let task = h.post(10.0, TaskTarget::Agent);
        let deposit = h.ledger.record_deposit(REQUESTER, 9 * WEI);

        let err = h.lifecycle.fund(&task.id, Some(&deposit)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DepositInvalid);
        assert_eq!(err.http_status(), 400);

        let stored = h.lifecycle.db().get_task(&task.id).unwrap().unwrap();
        assert!(stored.pending_settlement.is_none());
        assert!(stored.deposit_tx.is_none());
        assert!(h.ledger.write_calls().is_empty());
    }

    #[tokio::test]
    async fn deposit_to_wrong_address_is_invalid() {
        let h = setup();
        let task = h.post(1.0, TaskTarget::Agent);
        let deposit = h.ledger.record_transfer(REQUESTER, CLAIMANT, WEI, true);

        let err = h.lifecycle.fund(&task.id, Some(&deposit)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DepositInvalid);
    }

    #[tokio::test]
    async fn unbudgeted_task_needs_no_escrow() {
        let h = setup();
        let task = h.post(0.0, TaskTarget::Agent);
        let deposit = h.ledger.record_deposit(REQUESTER, WEI);

        let err = h.lifecycle.fund(&task.id, Some(&deposit)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoBudget);
    }

    #[tokio::test]
    async fn malformed_deposit_hash_is_a_validation_error() {
        let h = setup();
        let task = h.post(1.0, TaskTarget::Agent);

        let err = h.lifecycle.fund(&task.id, Some("0xnope")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFieldValue);
        assert_eq!(err.field.as_deref(), Some("depositTxHash"));

        let err = h.lifecycle.fund(&task.id, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingRequiredField);
    }

    #[tokio::test]
    async fn manual_escrow_tx_keeps_status() {
        let h = setup();
        let task = h.post(1.0, TaskTarget::Agent);
        let tx = format!("0x{}", "ab".repeat(32));

        let task = h.lifecycle.set_escrow_tx(&task.id, Some(&tx)).unwrap();
        assert_eq!(task.status, TaskStatus::Posted);
        assert_eq!(task.escrow_tx.as_deref(), Some(tx.as_str()));
        assert_eq!(h.actions(&task.id).last(), Some(&EventAction::EscrowTx));
        h.assert_consistent(&task.id);
    }

    #[tokio::test]
    async fn manual_escrow_tx_does_not_block_funding() {
        let h = setup();
        let task = h.post(1.0, TaskTarget::Agent);
        let manual = format!("0x{}", "ab".repeat(32));
        h.lifecycle.set_escrow_tx(&task.id, Some(&manual)).unwrap();

        let task = h.fund(&task, WEI).await;
        let escrow_tx = task.escrow_tx.clone().unwrap();
        assert_ne!(escrow_tx, manual);
        assert_eq!(
            h.ledger.escrow(&task.id).unwrap().state,
            EscrowState::Funded
        );

        let deposit = h.ledger.record_deposit(REQUESTER, WEI);
        let err = h.lifecycle.fund(&task.id, Some(&deposit)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EscrowAlreadyFunded);
        h.assert_consistent(&task.id);
    }

    #[tokio::test]
    async fn manual_escrow_tx_with_escrow_on_chain_is_already_funded() {
        let h = setup();
        let task = h.post(1.0, TaskTarget::Agent);
        let manual = format!("0x{}", "cd".repeat(32));
        h.lifecycle.set_escrow_tx(&task.id, Some(&manual)).unwrap();
        h.ledger.insert_escrow(
            &task.id,
            task_settlement::chain::OnChainEscrow {
                requester: REQUESTER.to_string(),
                provider: String::new(),
                amount_wei: WEI,
                state: EscrowState::Funded,
                created_at: 0,
                task_hash: task.task_hash.clone(),
                proof_hash: String::new(),
            },
        );

        let deposit = h.ledger.record_deposit(REQUESTER, WEI);
        let err = h.lifecycle.fund(&task.id, Some(&deposit)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EscrowAlreadyFunded);

        let task = h.lifecycle.db().get_task(&task.id).unwrap().unwrap();
        assert!(task.pending_settlement.is_none());
        assert!(task.deposit_tx.is_none());
        assert_eq!(task.escrow_tx.as_deref(), Some(manual.as_str()));
        assert!(h.ledger.write_calls().is_empty());
    }
}

mod matching_tests {
    use super::*;

    #[tokio::test]
    async fn understaked_provider_is_ineligible() {
        let h = setup();
        let task = h.post(10.0, TaskTarget::Agent);
        let provider_id = h.staked_provider(10);
        h.ledger.set_stake(PROVIDER_WALLET, 19 * WEI);

        let err = h
            .lifecycle
            .match_provider(&task.id, Some(&provider_id), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderIneligible);

        let stored = h.lifecycle.db().get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Posted);
        assert!(stored.provider_id.is_none());
    }

    #[tokio::test]
    async fn stake_is_rechecked_on_accept() {
        let h = setup();
        let task = h.post(10.0, TaskTarget::Agent);
        let provider_id = h.staked_provider(10);
        h.lifecycle
            .match_provider(&task.id, Some(&provider_id), None)
            .await
            .unwrap();

        h.ledger.set_stake(PROVIDER_WALLET, 0);
        let err = h.lifecycle.accept(&task.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderIneligible);
        assert_eq!(
            h.lifecycle.db().get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Escrowed
        );
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let h = setup();
        let task = h.post(1.0, TaskTarget::Agent);

        let err = h
            .lifecycle
            .match_provider(&task.id, Some("nobody"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderNotFound);
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn agent_tasks_cannot_be_claimed() {
        let h = setup();
        let task = h.post(1.0, TaskTarget::Agent);

        let err = h.lifecycle.claim(&task.id, Some(CLAIMANT)).unwrap_err();
        assert_eq!(err.code, ErrorCode::TargetMismatch);
    }

    #[tokio::test]
    async fn claimed_task_cannot_be_matched() {
        let h = setup();
        let task = h.post(1.0, TaskTarget::Human);
        let provider_id = h.staked_provider(1);
        h.lifecycle.claim(&task.id, Some(CLAIMANT)).unwrap();

        let err = h
            .lifecycle
            .match_provider(&task.id, Some(&provider_id), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);
        assert!(err.message.contains("IN_PROGRESS + MATCH"));
    }
}

mod settlement_failure_tests {
    use super::*;

    /// Funded, matched and proven task ready for verification.
    async fn ready_to_verify(h: &Harness) -> Task {
        let task = h.post(10.0, TaskTarget::Agent);
        let provider_id = h.staked_provider(10);
        let task = h.fund(&task, 10 * WEI).await;
        h.lifecycle
            .match_provider(&task.id, Some(&provider_id), None)
            .await
            .unwrap();
        h.lifecycle.accept(&task.id).await.unwrap();
        h.submit(&task.id, "ABC123")
    }

    #[tokio::test]
    async fn chain_outage_leaves_no_partial_commit() {
        let h = setup();
        let task = ready_to_verify(&h).await;
        let events_before = h.actions(&task.id).len();

        h.ledger.set_fail_writes(true);
        let err = h.lifecycle.verify(&task.id, approve()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ChainUnavailable);
        assert_eq!(err.http_status(), 500);

        let stored = h.lifecycle.db().get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::ProofSubmitted);
        assert!(stored.pending_settlement.is_none());
        assert!(stored.payout_tx.is_none());
        assert_eq!(h.actions(&task.id).len(), events_before);
        assert_eq!(
            h.ledger.escrow(&task.id).unwrap().state,
            EscrowState::Funded
        );

        h.ledger.set_fail_writes(false);
        let task = h.lifecycle.verify(&task.id, approve()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Closed);
        h.assert_consistent(&task.id);
    }

    #[tokio::test]
    async fn lost_receipt_keeps_reservation_until_reconciled() {
        let h = setup();
        let task = ready_to_verify(&h).await;

        h.ledger.set_lose_receipts(true);
        let err = h.lifecycle.verify(&task.id, approve()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ChainUnconfirmed);
        h.ledger.set_lose_receipts(false);

        let stored = h.lifecycle.db().get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::ProofSubmitted);
        assert!(stored.pending_settlement.is_some());
        assert_eq!(
            h.ledger.escrow(&task.id).unwrap().state,
            EscrowState::Released
        );

        let err = h.lifecycle.verify(&task.id, approve()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SettlementInProgress);

        // Not stale yet.
        assert!(h.lifecycle.reconcile(false).await.unwrap().is_empty());

        let later = now_ms() + 3_600_000;
        let preview = h.lifecycle.reconcile_at(later, true).await.unwrap();
        assert_eq!(preview.len(), 1);
        assert!(!preview[0].applied);
        assert_eq!(preview[0].outcome, ReconcileOutcome::ReleaseCommitted);

        let actions = h.lifecycle.reconcile_at(later, false).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert!(actions[0].applied);
        assert_eq!(actions[0].escrow_state, Some(EscrowState::Released));

        let stored = h.lifecycle.db().get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Closed);
        assert!(stored.pending_settlement.is_none());
        h.assert_consistent(&task.id);

        // Exactly one release reached the chain.
        let releases = h
            .ledger
            .write_calls()
            .into_iter()
            .filter(|c| matches!(c, LedgerCall::Release { .. }))
            .count();
        assert_eq!(releases, 1);
    }

    #[tokio::test]
    async fn lost_fund_receipt_is_recorded_by_reconcile() {
        let h = setup();
        let task = h.post(10.0, TaskTarget::Agent);
        let deposit = h.ledger.record_deposit(REQUESTER, 10 * WEI);

        h.ledger.set_lose_receipts(true);
        let err = h.lifecycle.fund(&task.id, Some(&deposit)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ChainUnconfirmed);
        h.ledger.set_lose_receipts(false);

        let actions = h
            .lifecycle
            .reconcile_at(now_ms() + 3_600_000, false)
            .await
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].outcome, ReconcileOutcome::FundRecorded);

        let stored = h.lifecycle.db().get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Posted);
        assert!(stored.pending_settlement.is_none());
        assert_eq!(stored.deposit_tx.as_deref(), Some(deposit.as_str()));
        assert_eq!(h.actions(&task.id).last(), Some(&EventAction::Reconcile));

        let retry = h.ledger.record_deposit(REQUESTER, 10 * WEI);
        let err = h.lifecycle.fund(&task.id, Some(&retry)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EscrowAlreadyFunded);
        h.assert_consistent(&task.id);
    }
}

mod timeout_tests {
    use super::*;

    #[tokio::test]
    async fn refund_is_terminal() {
        let h = setup();
        let task = h.post(0.0, TaskTarget::Human);
        h.lifecycle.claim(&task.id, Some(CLAIMANT)).unwrap();

        let deadline = task.sla_deadline_ms();
        let task = h.lifecycle.refund_at(&task.id, deadline).await.unwrap();
        assert_eq!(task.status, TaskStatus::Refunded);

        let err = h
            .lifecycle
            .refund_at(&task.id, deadline + 1_000)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);

        let err = h.submit_err(&task.id);
        assert_eq!(err, ErrorCode::InvalidTransition);
        h.assert_consistent(&task.id);
    }

    #[tokio::test]
    async fn unfunded_budget_refund_makes_no_chain_write() {
        let h = setup();
        let task = h.post(3.0, TaskTarget::Human);
        h.lifecycle.claim(&task.id, Some(CLAIMANT)).unwrap();
        h.submit(&task.id, "LATE");

        let task = h
            .lifecycle
            .refund_at(&task.id, task.sla_deadline_ms() + 1)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Refunded);
        assert!(task.refund_tx.is_none());
        assert!(h.ledger.write_calls().is_empty());
        assert_eq!(
            h.actions(&task.id)[3..],
            [t(TaskAction::Timeout), t(TaskAction::Refund)]
        );
    }

    #[tokio::test]
    async fn posted_task_cannot_time_out() {
        let h = setup();
        let task = h.post(0.0, TaskTarget::Agent);

        let err = h
            .lifecycle
            .refund_at(&task.id, task.sla_deadline_ms())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);
    }
}

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn poll_reports_readiness() {
        let h = setup();
        let task = h.post(0.0, TaskTarget::Human);

        match h.lifecycle.poll(&task.id, TaskStatus::Posted).unwrap() {
            PollResult::Ready { ready, task } => {
                assert!(ready);
                assert_eq!(task.status, TaskStatus::Posted);
            }
            other => panic!("expected ready, got {:?}", other),
        }

        match h.lifecycle.poll(&task.id, TaskStatus::Closed).unwrap() {
            PollResult::Pending {
                ready,
                current_status,
            } => {
                assert!(!ready);
                assert_eq!(current_status, TaskStatus::Posted);
            }
            other => panic!("expected pending, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let h = setup();
        let open = h.post(0.0, TaskTarget::Human);
        let claimed = h.post(0.0, TaskTarget::Human);
        h.lifecycle.claim(&claimed.id, Some(CLAIMANT)).unwrap();

        let posted = h.lifecycle.list(Some(TaskStatus::Posted)).unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].id, open.id);
        assert_eq!(h.lifecycle.list(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn detail_includes_events_and_proof() {
        let h = setup();
        let task = h.post(0.0, TaskTarget::Human);
        h.lifecycle.claim(&task.id, Some(CLAIMANT)).unwrap();
        h.submit(&task.id, "XYZ");

        let detail = h.lifecycle.get_detail(&task.id).unwrap();
        assert_eq!(detail.task.status, TaskStatus::ProofSubmitted);
        assert_eq!(detail.events.len(), 3);
        assert_eq!(detail.events[0].from_status, TaskStatus::Draft);
        assert!(detail.proof.unwrap().proof_hash.starts_with("0x"));
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let h = setup();
        let err = h.lifecycle.get_detail("missing").unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskNotFound);
    }

    #[tokio::test]
    async fn audit_all_covers_every_task() {
        let h = setup();
        h.post(0.0, TaskTarget::Human);
        let task = h.post(0.0, TaskTarget::Human);
        h.lifecycle.claim(&task.id, Some(CLAIMANT)).unwrap();

        let reports = h.lifecycle.audit_all().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.is_consistent()));
    }
}

impl Harness {
    fn submit_err(&self, task_id: &str) -> ErrorCode {
        self.lifecycle
            .submit_proof(
                task_id,
                SubmitProofInput {
                    artifacts: vec![],
                    notes: Some("too late".to_string()),
                },
            )
            .unwrap_err()
            .code
    }
}
