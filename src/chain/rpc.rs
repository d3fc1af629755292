//! Ethereum JSON-RPC transport.
//!
//! Writes are submitted with `eth_sendTransaction` from the configured
//! settlement account, so the node (or a signing proxy in front of it) must
//! hold that account's key. Every write waits for its receipt.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::abi::{quantity, to_hex_data};
use super::ChainError;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// A transaction as returned by `eth_getTransactionByHash`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub block_number: Option<String>,
}

/// A receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: String,
    pub status: Option<String>,
    pub block_number: Option<String>,
}

impl RpcReceipt {
    pub fn succeeded(&self) -> bool {
        self.status.as_deref() == Some("0x1")
    }
}

/// Parameters for `eth_sendTransaction`.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRequest {
    pub from: String,
    pub to: String,
    pub data: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
}

impl TransactionRequest {
    pub fn call(from: &str, to: &str, calldata: &[u8], value_wei: u128) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            data: to_hex_data(calldata),
            value: quantity(value_wei),
            gas: None,
        }
    }

    pub fn with_gas(mut self, gas: Option<u64>) -> Self {
        self.gas = gas.map(|g| quantity(g as u128));
        self
    }
}

pub struct RpcClient {
    http: Client,
    url: String,
    next_id: AtomicU64,
    receipt_timeout: Duration,
    poll_interval: Duration,
}

impl RpcClient {
    pub fn new(
        url: impl Into<String>,
        request_timeout: Duration,
        receipt_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, ChainError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ChainError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
            receipt_timeout,
            poll_interval,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue one JSON-RPC request. A `null` result decodes into `Option::None`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "rpc request");

        let response = self.http.post(&self.url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ChainError::Transport(format!(
                "HTTP {} from RPC node: {}",
                status.as_u16(),
                text
            )));
        }

        let parsed: RpcResponse = serde_json::from_str(&text)
            .map_err(|e| ChainError::Decode(format!("{}: {}", e, text)))?;

        if let Some(error) = parsed.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(parsed.result.unwrap_or(Value::Null))
            .map_err(|e| ChainError::Decode(format!("{} result: {}", method, e)))
    }

    /// `eth_call` against the latest block; returns the raw hex return data.
    pub async fn eth_call(&self, to: &str, calldata: &[u8]) -> Result<String, ChainError> {
        self.request(
            "eth_call",
            json!([{ "to": to, "data": to_hex_data(calldata) }, "latest"]),
        )
        .await
    }

    pub async fn send_transaction(&self, tx: &TransactionRequest) -> Result<String, ChainError> {
        self.request("eth_sendTransaction", json!([tx])).await
    }

    pub async fn transaction(&self, tx_hash: &str) -> Result<Option<RpcTransaction>, ChainError> {
        self.request("eth_getTransactionByHash", json!([tx_hash])).await
    }

    pub async fn receipt(&self, tx_hash: &str) -> Result<Option<RpcReceipt>, ChainError> {
        self.request("eth_getTransactionReceipt", json!([tx_hash])).await
    }

    /// Poll for a receipt until it appears or the receipt timeout elapses.
    /// A receipt with a failed status is reported as [`ChainError::Reverted`].
    pub async fn wait_for_receipt(&self, tx_hash: &str) -> Result<RpcReceipt, ChainError> {
        let started = Instant::now();

        loop {
            if let Some(receipt) = self.receipt(tx_hash).await? {
                if receipt.succeeded() {
                    return Ok(receipt);
                }
                warn!(tx_hash, status = ?receipt.status, "transaction reverted");
                return Err(ChainError::Reverted {
                    tx_hash: tx_hash.to_string(),
                });
            }

            if started.elapsed() >= self.receipt_timeout {
                return Err(ChainError::ReceiptTimeout {
                    tx_hash: tx_hash.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Submit a transaction and wait for a successful receipt.
    pub async fn send_and_confirm(&self, tx: &TransactionRequest) -> Result<String, ChainError> {
        let tx_hash = self.send_transaction(tx).await.map_err(|err| match err {
            // Never reached the node, or the node refused it outright.
            err @ (ChainError::Unreachable(_) | ChainError::Rpc { .. }) => err,
            other => {
                warn!(to = %tx.to, error = %other, "transaction submission outcome unknown");
                ChainError::SubmissionUnknown {
                    reason: other.to_string(),
                }
            }
        })?;
        debug!(tx_hash = %tx_hash, to = %tx.to, "transaction submitted");
        match self.wait_for_receipt(&tx_hash).await {
            Ok(_) => Ok(tx_hash),
            Err(err @ (ChainError::Reverted { .. } | ChainError::ReceiptTimeout { .. })) => Err(err),
            Err(err) => Err(ChainError::Unconfirmed {
                tx_hash,
                reason: err.to_string(),
            }),
        }
    }
}
