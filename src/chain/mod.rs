//! On-chain escrow settlement and stake eligibility.
//!
//! The lifecycle talks to the chain only through [`EscrowClient`] and
//! [`StakeRegistry`]. Nothing reported here is cached: every call is a fresh
//! read of chain state, and every write blocks until its receipt confirms.

pub mod abi;
pub mod eligibility;
pub mod escrow;
pub mod memory;
pub mod rpc;

pub use eligibility::{EligibilityChecker, RpcStakeRegistry};
pub use escrow::RpcEscrowClient;
pub use memory::MemoryLedger;
pub use rpc::RpcClient;

use async_trait::async_trait;
use serde::Serialize;

/// Number of decimals of the native currency.
pub const WEI_DECIMALS: usize = 18;

/// Failure talking to the chain. Every variant is safe to retry at the
/// operation level because idempotency checks precede all writes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("chain transport error: {0}")]
    Transport(String),

    /// The node could not be reached, so nothing was sent.
    #[error("chain node unreachable: {0}")]
    Unreachable(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    #[error("no receipt for transaction {tx_hash} after {waited_ms}ms")]
    ReceiptTimeout { tx_hash: String, waited_ms: u64 },

    #[error("transaction {tx_hash} submitted but not confirmed: {reason}")]
    Unconfirmed { tx_hash: String, reason: String },

    /// The submit request failed after leaving this process; the node may
    /// still have accepted the transaction.
    #[error("transaction submission outcome unknown: {reason}")]
    SubmissionUnknown { reason: String },

    #[error("failed to decode chain response: {0}")]
    Decode(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl ChainError {
    /// True when a write may have landed on chain even though it failed
    /// locally. The caller must leave such outcomes to reconciliation.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            ChainError::ReceiptTimeout { .. }
                | ChainError::Unconfirmed { .. }
                | ChainError::SubmissionUnknown { .. }
        )
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChainError::Transport(format!("request timeout: {}", err))
        } else if err.is_connect() {
            ChainError::Unreachable(err.to_string())
        } else if err.is_decode() {
            ChainError::Decode(err.to_string())
        } else {
            ChainError::Transport(err.to_string())
        }
    }
}

/// Result of checking a requester's deposit transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepositCheck {
    pub valid: bool,
    pub payer: Option<String>,
}

impl DepositCheck {
    pub fn rejected() -> Self {
        Self {
            valid: false,
            payer: None,
        }
    }

    pub fn accepted(payer: impl Into<String>) -> Self {
        Self {
            valid: true,
            payer: Some(payer.into()),
        }
    }
}

/// Escrow status as stored by the escrow contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    None,
    Funded,
    Released,
    Refunded,
}

impl EscrowState {
    pub fn from_code(code: u128) -> Result<Self, ChainError> {
        match code {
            0 => Ok(EscrowState::None),
            1 => Ok(EscrowState::Funded),
            2 => Ok(EscrowState::Released),
            3 => Ok(EscrowState::Refunded),
            other => Err(ChainError::Decode(format!("unknown escrow status {}", other))),
        }
    }
}

/// Escrow record read from the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnChainEscrow {
    pub requester: String,
    pub provider: String,
    pub amount_wei: u128,
    pub state: EscrowState,
    pub created_at: u64,
    pub task_hash: String,
    pub proof_hash: String,
}

/// Escrow contract operations.
#[async_trait]
pub trait EscrowClient: Send + Sync {
    /// Whether an escrow record exists for the task (in any state).
    async fn escrow_exists(&self, task_id: &str) -> Result<bool, ChainError>;

    /// Full escrow record, `None` when no escrow exists.
    async fn escrow_details(&self, task_id: &str) -> Result<Option<OnChainEscrow>, ChainError>;

    /// Fails closed: `valid` is only true for a confirmed, successful
    /// transfer to the settlement address of at least `expected_wei`.
    async fn verify_deposit(
        &self,
        tx_hash: &str,
        expected_wei: u128,
    ) -> Result<DepositCheck, ChainError>;

    async fn create_escrow(
        &self,
        task_id: &str,
        task_hash: &str,
        amount_wei: u128,
    ) -> Result<String, ChainError>;

    async fn release_escrow(
        &self,
        task_id: &str,
        payee: &str,
        proof_hash: &str,
    ) -> Result<String, ChainError>;

    async fn refund_escrow(&self, task_id: &str) -> Result<String, ChainError>;
}

/// Stake registry consulted for provider eligibility.
#[async_trait]
pub trait StakeRegistry: Send + Sync {
    async fn is_eligible(&self, provider: &str, min_stake_wei: u128) -> Result<bool, ChainError>;
}

/// Convert a currency amount to wei using its shortest decimal form.
///
/// Digits beyond 18 decimals are truncated. Negative, non-finite and
/// overflowing amounts yield `None`.
pub fn to_wei(amount: f64) -> Option<u128> {
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }

    let repr = format!("{}", amount);
    let (whole, frac) = repr.split_once('.').unwrap_or((repr.as_str(), ""));
    let frac = &frac[..frac.len().min(WEI_DECIMALS)];

    let whole: u128 = whole.parse().ok()?;
    let frac: u128 = if frac.is_empty() {
        0
    } else {
        format!("{:0<width$}", frac, width = WEI_DECIMALS).parse().ok()?
    };

    whole
        .checked_mul(10u128.pow(WEI_DECIMALS as u32))?
        .checked_add(frac)
}

/// Validate a `0x`-prefixed 20-byte address and return it lowercased.
pub fn normalize_address(address: &str) -> Result<String, ChainError> {
    let trimmed = address.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| ChainError::InvalidAddress(address.to_string()))?;

    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ChainError::InvalidAddress(address.to_string()));
    }

    Ok(format!("0x{}", hex_part.to_ascii_lowercase()))
}

/// Case-insensitive address comparison.
pub fn same_address(a: &str, b: &str) -> bool {
    match (normalize_address(a), normalize_address(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
