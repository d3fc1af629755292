//! `/providers` routes.

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use super::{AppState, parse_body};
use crate::chain::{normalize_address, to_wei};
use crate::db::NewProvider;
use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Default, Deserialize)]
pub struct ProviderQuery {
    capability: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProviderBody {
    name: Option<String>,
    wallet_address: Option<String>,
    #[serde(default)]
    capability_ids: Vec<String>,
    price: Option<f64>,
    eta_minutes: Option<i64>,
    stake_amount: Option<f64>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> LifecycleResult<impl IntoResponse> {
    let capability = query.capability.as_deref().filter(|c| !c.is_empty());
    let providers = state.lifecycle.db().list_providers(capability)?;
    Ok(Json(providers))
}

pub async fn create(
    State(state): State<AppState>,
    body: Bytes,
) -> LifecycleResult<impl IntoResponse> {
    let body: CreateProviderBody = parse_body(&body)?;

    let name = body
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| LifecycleError::missing_field("name"))?;
    let wallet = body
        .wallet_address
        .ok_or_else(|| LifecycleError::missing_field("walletAddress"))?;
    let wallet_address = normalize_address(&wallet).map_err(|_| {
        LifecycleError::invalid_value("walletAddress", "walletAddress is not a valid address")
    })?;

    let price = body.price.unwrap_or(0.0);
    if !price.is_finite() || price < 0.0 {
        return Err(LifecycleError::invalid_value(
            "price",
            "price must be a non-negative number",
        ));
    }

    let stake_amount = body.stake_amount.unwrap_or(0.0);
    let stake_wei = to_wei(stake_amount).ok_or_else(|| {
        LifecycleError::invalid_value("stakeAmount", "stakeAmount must be a non-negative number")
    })?;

    let provider = state.lifecycle.db().insert_provider(&NewProvider {
        name,
        wallet_address,
        capability_ids: body.capability_ids,
        price,
        eta_minutes: body.eta_minutes.unwrap_or(60).max(0),
        rating: 5.0,
        success_rate: 1.0,
        stake_amount,
    })?;

    if let Some(ledger) = &state.ledger {
        ledger.set_stake(&provider.wallet_address, stake_wei);
    }

    Ok((StatusCode::CREATED, Json(provider)))
}
