//! In-process ledger implementing the escrow and stake contracts.
//!
//! Backs the `memory` chain mode for local development and is the chain
//! double used throughout the test suite. It keeps a log of every call so
//! tests can assert which chain operations ran.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{
    normalize_address, same_address, ChainError, DepositCheck, EscrowClient, EscrowState,
    OnChainEscrow, StakeRegistry,
};

/// Settlement address used when none is supplied.
pub const DEFAULT_SETTLEMENT_ADDRESS: &str = "0x00000000000000000000000000000000005e7713";

/// A chain call observed by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    EscrowExists(String),
    EscrowDetails(String),
    VerifyDeposit(String),
    CreateEscrow { task_id: String, amount_wei: u128 },
    Release { task_id: String, payee: String },
    Refund(String),
    IsEligible { provider: String, min_stake_wei: u128 },
}

impl LedgerCall {
    /// True for calls that move funds.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            LedgerCall::CreateEscrow { .. } | LedgerCall::Release { .. } | LedgerCall::Refund(_)
        )
    }
}

#[derive(Debug, Clone)]
struct Deposit {
    from: String,
    to: String,
    value_wei: u128,
    succeeded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum WriteFault {
    #[default]
    None,
    /// Writes fail before reaching the chain.
    Outage,
    /// Writes land but their receipts never arrive.
    LostReceipt,
}

#[derive(Default)]
struct LedgerState {
    escrows: HashMap<String, OnChainEscrow>,
    deposits: HashMap<String, Deposit>,
    stakes: HashMap<String, u128>,
    calls: Vec<LedgerCall>,
    tx_counter: u64,
    fault: WriteFault,
}

impl LedgerState {
    fn next_tx_hash(&mut self) -> String {
        self.tx_counter += 1;
        format!("0x{:064x}", self.tx_counter)
    }

    fn confirm(&self, tx_hash: String) -> Result<String, ChainError> {
        match self.fault {
            WriteFault::LostReceipt => Err(ChainError::ReceiptTimeout {
                tx_hash,
                waited_ms: 0,
            }),
            _ => Ok(tx_hash),
        }
    }
}

pub struct MemoryLedger {
    settlement_address: String,
    state: Mutex<LedgerState>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLEMENT_ADDRESS)
    }
}

impl MemoryLedger {
    pub fn new(settlement_address: &str) -> Self {
        Self {
            settlement_address: normalize_address(settlement_address)
                .unwrap_or_else(|_| settlement_address.to_ascii_lowercase()),
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn settlement_address(&self) -> &str {
        &self.settlement_address
    }

    /// Record a confirmed transfer to the settlement address.
    pub fn record_deposit(&self, from: &str, value_wei: u128) -> String {
        let to = self.settlement_address.clone();
        self.record_transfer(from, &to, value_wei, true)
    }

    /// Record an arbitrary transfer and return its hash.
    pub fn record_transfer(&self, from: &str, to: &str, value_wei: u128, succeeded: bool) -> String {
        let mut state = self.state();
        let tx_hash = state.next_tx_hash();
        state.deposits.insert(
            tx_hash.clone(),
            Deposit {
                from: from.to_ascii_lowercase(),
                to: to.to_ascii_lowercase(),
                value_wei,
                succeeded,
            },
        );
        tx_hash
    }

    pub fn set_stake(&self, provider: &str, stake_wei: u128) {
        self.state()
            .stakes
            .insert(provider.to_ascii_lowercase(), stake_wei);
    }

    /// Make every subsequent write fail with a transport error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fault = if fail { WriteFault::Outage } else { WriteFault::None };
    }

    /// Apply subsequent writes but report them as unconfirmed.
    pub fn set_lose_receipts(&self, lose: bool) {
        self.state().fault = if lose {
            WriteFault::LostReceipt
        } else {
            WriteFault::None
        };
    }

    /// Insert an escrow record directly, as if created out of band.
    pub fn insert_escrow(&self, task_id: &str, escrow: OnChainEscrow) {
        self.state().escrows.insert(task_id.to_string(), escrow);
    }

    pub fn escrow(&self, task_id: &str) -> Option<OnChainEscrow> {
        self.state().escrows.get(task_id).cloned()
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.state().calls.clone()
    }

    pub fn write_calls(&self) -> Vec<LedgerCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.is_write())
            .cloned()
            .collect()
    }

    fn begin_write(&self, call: LedgerCall) -> Result<MutexGuard<'_, LedgerState>, ChainError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.fault == WriteFault::Outage {
            return Err(ChainError::Unreachable("simulated chain outage".to_string()));
        }
        Ok(state)
    }

    fn settle(
        &self,
        task_id: &str,
        call: LedgerCall,
        next: EscrowState,
        payee: Option<&str>,
    ) -> Result<String, ChainError> {
        let mut state = self.begin_write(call)?;
        let tx_hash = state.next_tx_hash();

        match state.escrows.get_mut(task_id) {
            Some(escrow) if escrow.state == EscrowState::Funded => {
                escrow.state = next;
                if let Some(payee) = payee {
                    escrow.provider = payee.to_ascii_lowercase();
                }
                state.confirm(tx_hash)
            }
            _ => Err(ChainError::Reverted { tx_hash }),
        }
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl EscrowClient for MemoryLedger {
    async fn escrow_exists(&self, task_id: &str) -> Result<bool, ChainError> {
        let mut state = self.state();
        state.calls.push(LedgerCall::EscrowExists(task_id.to_string()));
        Ok(state.escrows.contains_key(task_id))
    }

    async fn escrow_details(&self, task_id: &str) -> Result<Option<OnChainEscrow>, ChainError> {
        let mut state = self.state();
        state.calls.push(LedgerCall::EscrowDetails(task_id.to_string()));
        Ok(state.escrows.get(task_id).cloned())
    }

    async fn verify_deposit(
        &self,
        tx_hash: &str,
        expected_wei: u128,
    ) -> Result<DepositCheck, ChainError> {
        let mut state = self.state();
        state.calls.push(LedgerCall::VerifyDeposit(tx_hash.to_string()));

        let check = match state.deposits.get(tx_hash) {
            Some(deposit)
                if deposit.succeeded
                    && same_address(&deposit.to, &self.settlement_address)
                    && deposit.value_wei >= expected_wei =>
            {
                DepositCheck::accepted(deposit.from.clone())
            }
            _ => DepositCheck::rejected(),
        };
        Ok(check)
    }

    async fn create_escrow(
        &self,
        task_id: &str,
        task_hash: &str,
        amount_wei: u128,
    ) -> Result<String, ChainError> {
        let mut state = self.begin_write(LedgerCall::CreateEscrow {
            task_id: task_id.to_string(),
            amount_wei,
        })?;
        let tx_hash = state.next_tx_hash();

        if state.escrows.contains_key(task_id) {
            return Err(ChainError::Reverted { tx_hash });
        }

        state.escrows.insert(
            task_id.to_string(),
            OnChainEscrow {
                requester: self.settlement_address.clone(),
                provider: format!("0x{}", "0".repeat(40)),
                amount_wei,
                state: EscrowState::Funded,
                created_at: unix_seconds(),
                task_hash: task_hash.to_string(),
                proof_hash: format!("0x{}", "0".repeat(64)),
            },
        );
        state.confirm(tx_hash)
    }

    async fn release_escrow(
        &self,
        task_id: &str,
        payee: &str,
        proof_hash: &str,
    ) -> Result<String, ChainError> {
        let call = LedgerCall::Release {
            task_id: task_id.to_string(),
            payee: payee.to_ascii_lowercase(),
        };
        let result = self.settle(task_id, call, EscrowState::Released, Some(payee));
        if let Some(escrow) = self.state().escrows.get_mut(task_id) {
            if escrow.state == EscrowState::Released {
                escrow.proof_hash = proof_hash.to_string();
            }
        }
        result
    }

    async fn refund_escrow(&self, task_id: &str) -> Result<String, ChainError> {
        self.settle(
            task_id,
            LedgerCall::Refund(task_id.to_string()),
            EscrowState::Refunded,
            None,
        )
    }
}

#[async_trait]
impl StakeRegistry for MemoryLedger {
    async fn is_eligible(&self, provider: &str, min_stake_wei: u128) -> Result<bool, ChainError> {
        let mut state = self.state();
        let provider = provider.to_ascii_lowercase();
        state.calls.push(LedgerCall::IsEligible {
            provider: provider.clone(),
            min_stake_wei,
        });
        Ok(state.stakes.get(&provider).copied().unwrap_or(0) >= min_stake_wei)
    }
}
