//! `/ledger` routes, mounted only in memory chain mode.

use axum::{Json, body::Bytes, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;
use serde_json::json;

use super::{AppState, parse_body};
use crate::chain::{normalize_address, to_wei, ChainError};
use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepositBody {
    from_address: Option<String>,
    amount: Option<f64>,
}

/// Record a confirmed transfer to the settlement address and return its hash,
/// which can then be passed to `POST /tasks/{id}/fund`.
pub async fn deposit(
    State(state): State<AppState>,
    body: Bytes,
) -> LifecycleResult<impl IntoResponse> {
    let ledger = state
        .ledger
        .as_ref()
        .ok_or(ChainError::NotConfigured("memory ledger"))?;
    let body: DepositBody = parse_body(&body)?;

    let from = body
        .from_address
        .ok_or_else(|| LifecycleError::missing_field("fromAddress"))?;
    let from = normalize_address(&from).map_err(|_| {
        LifecycleError::invalid_value("fromAddress", "fromAddress is not a valid address")
    })?;

    let amount = body
        .amount
        .ok_or_else(|| LifecycleError::missing_field("amount"))?;
    let amount_wei = to_wei(amount)
        .filter(|wei| *wei > 0)
        .ok_or_else(|| LifecycleError::invalid_value("amount", "amount must be positive"))?;

    let tx_hash = ledger.record_deposit(&from, amount_wei);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "txHash": tx_hash,
            "from": from,
            "to": ledger.settlement_address(),
            "amountWei": amount_wei.to_string(),
        })),
    ))
}
