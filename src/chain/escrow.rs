//! Escrow contract client over JSON-RPC.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::abi::{self, encode_call, Token};
use super::rpc::{RpcClient, TransactionRequest};
use super::{
    normalize_address, same_address, ChainError, DepositCheck, EscrowClient, EscrowState,
    OnChainEscrow,
};
use crate::hashing::{task_id_to_bytes32, to_hex32};

const ESCROW_EXISTS: &str = "escrowExists(bytes32)";
const GET_ESCROW: &str = "getEscrow(bytes32)";
const CREATE_ESCROW: &str = "createEscrow(bytes32,bytes32)";
const RELEASE: &str = "release(bytes32,address,bytes32)";
const REFUND: &str = "refund(bytes32)";

/// Number of words in the `getEscrow` return tuple.
const ESCROW_TUPLE_WORDS: usize = 7;

pub struct RpcEscrowClient {
    rpc: Arc<RpcClient>,
    escrow_address: String,
    settlement_address: String,
    gas_limit: Option<u64>,
}

impl RpcEscrowClient {
    pub fn new(
        rpc: Arc<RpcClient>,
        escrow_address: &str,
        settlement_address: &str,
        gas_limit: Option<u64>,
    ) -> Result<Self, ChainError> {
        Ok(Self {
            rpc,
            escrow_address: normalize_address(escrow_address)?,
            settlement_address: normalize_address(settlement_address)?,
            gas_limit,
        })
    }

    fn task_key(task_id: &str) -> Token {
        Token::Bytes32(task_id_to_bytes32(task_id))
    }

    async fn submit(&self, calldata: Vec<u8>, value_wei: u128) -> Result<String, ChainError> {
        let tx = TransactionRequest::call(
            &self.settlement_address,
            &self.escrow_address,
            &calldata,
            value_wei,
        )
        .with_gas(self.gas_limit);
        self.rpc.send_and_confirm(&tx).await
    }
}

#[async_trait]
impl EscrowClient for RpcEscrowClient {
    async fn escrow_exists(&self, task_id: &str) -> Result<bool, ChainError> {
        let data = encode_call(ESCROW_EXISTS, &[Self::task_key(task_id)]);
        let ret = self.rpc.eth_call(&self.escrow_address, &data).await?;
        abi::decode_bool(&ret)
    }

    async fn escrow_details(&self, task_id: &str) -> Result<Option<OnChainEscrow>, ChainError> {
        let data = encode_call(GET_ESCROW, &[Self::task_key(task_id)]);
        let ret = self.rpc.eth_call(&self.escrow_address, &data).await?;
        let words = abi::decode_words(&ret)?;

        if words.len() < ESCROW_TUPLE_WORDS {
            return Err(ChainError::Decode(format!(
                "getEscrow returned {} words, expected {}",
                words.len(),
                ESCROW_TUPLE_WORDS
            )));
        }

        let state = EscrowState::from_code(abi::word_to_u128(&words[3])?)?;
        if state == EscrowState::None {
            return Ok(None);
        }

        Ok(Some(OnChainEscrow {
            requester: abi::word_to_address(&words[0]),
            provider: abi::word_to_address(&words[1]),
            amount_wei: abi::word_to_u128(&words[2])?,
            state,
            created_at: abi::word_to_u128(&words[4])? as u64,
            task_hash: abi::word_to_hex(&words[5]),
            proof_hash: abi::word_to_hex(&words[6]),
        }))
    }

    async fn verify_deposit(
        &self,
        tx_hash: &str,
        expected_wei: u128,
    ) -> Result<DepositCheck, ChainError> {
        let Some(tx) = self.rpc.transaction(tx_hash).await? else {
            debug!(tx_hash, "deposit transaction not found");
            return Ok(DepositCheck::rejected());
        };

        if tx.block_number.is_none() {
            debug!(tx_hash, "deposit transaction still pending");
            return Ok(DepositCheck::rejected());
        }

        match self.rpc.receipt(tx_hash).await? {
            Some(receipt) if receipt.succeeded() => {}
            _ => {
                debug!(tx_hash, "deposit transaction has no successful receipt");
                return Ok(DepositCheck::rejected());
            }
        }

        let to_settlement = tx
            .to
            .as_deref()
            .is_some_and(|to| same_address(to, &self.settlement_address));
        if !to_settlement {
            warn!(tx_hash, to = ?tx.to, "deposit sent to wrong recipient");
            return Ok(DepositCheck::rejected());
        }

        let value = abi::parse_quantity(&tx.value)?;
        if value < expected_wei {
            warn!(tx_hash, value, expected_wei, "deposit below task budget");
            return Ok(DepositCheck::rejected());
        }

        Ok(DepositCheck::accepted(tx.from.to_ascii_lowercase()))
    }

    async fn create_escrow(
        &self,
        task_id: &str,
        task_hash: &str,
        amount_wei: u128,
    ) -> Result<String, ChainError> {
        let data = encode_call(
            CREATE_ESCROW,
            &[Self::task_key(task_id), Token::bytes32_hex(task_hash)?],
        );
        let tx_hash = self.submit(data, amount_wei).await?;
        info!(
            task_id,
            escrow_key = %escrow_key(task_id),
            tx_hash = %tx_hash,
            amount_wei,
            "escrow created"
        );
        Ok(tx_hash)
    }

    async fn release_escrow(
        &self,
        task_id: &str,
        payee: &str,
        proof_hash: &str,
    ) -> Result<String, ChainError> {
        let data = encode_call(
            RELEASE,
            &[
                Self::task_key(task_id),
                Token::address(payee)?,
                Token::bytes32_hex(proof_hash)?,
            ],
        );
        let tx_hash = self.submit(data, 0).await?;
        info!(task_id, payee, tx_hash = %tx_hash, "escrow released");
        Ok(tx_hash)
    }

    async fn refund_escrow(&self, task_id: &str) -> Result<String, ChainError> {
        let data = encode_call(REFUND, &[Self::task_key(task_id)]);
        let tx_hash = self.submit(data, 0).await?;
        info!(task_id, tx_hash = %tx_hash, "escrow refunded");
        Ok(tx_hash)
    }
}

/// Hex escrow key for a task, as used in logs and diagnostics.
fn escrow_key(task_id: &str) -> String {
    to_hex32(&task_id_to_bytes32(task_id))
}
