//! `/tasks` routes.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use super::{AppState, parse_body};
use crate::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::{PostTaskInput, SubmitProofInput, VerifyInput};
use crate::types::TaskStatus;

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    status: Option<String>,
}

fn parse_status(raw: &str) -> LifecycleResult<TaskStatus> {
    raw.trim()
        .to_ascii_uppercase()
        .parse::<TaskStatus>()
        .map_err(|e| LifecycleError::invalid_value("status", e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimBody {
    wallet_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchBody {
    provider_id: Option<String>,
    escrow_tx: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundBody {
    deposit_tx_hash: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EscrowTxBody {
    tx_hash: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    body: Bytes,
) -> LifecycleResult<impl IntoResponse> {
    let input: PostTaskInput = parse_body(&body)?;
    let task = state.lifecycle.post_task(input)?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> LifecycleResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_status)
        .transpose()?;
    Ok(Json(state.lifecycle.list(status)?))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> LifecycleResult<impl IntoResponse> {
    Ok(Json(state.lifecycle.get_detail(&task_id)?))
}

pub async fn claim(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> LifecycleResult<impl IntoResponse> {
    let body: ClaimBody = parse_body(&body)?;
    let task = state
        .lifecycle
        .claim(&task_id, body.wallet_address.as_deref())?;
    Ok(Json(task))
}

pub async fn match_provider(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> LifecycleResult<impl IntoResponse> {
    let body: MatchBody = parse_body(&body)?;
    let task = state
        .lifecycle
        .match_provider(
            &task_id,
            body.provider_id.as_deref(),
            body.escrow_tx.as_deref(),
        )
        .await?;
    Ok(Json(task))
}

pub async fn accept(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> LifecycleResult<impl IntoResponse> {
    Ok(Json(state.lifecycle.accept(&task_id).await?))
}

pub async fn fund(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> LifecycleResult<impl IntoResponse> {
    let body: FundBody = parse_body(&body)?;
    let task = state
        .lifecycle
        .fund(&task_id, body.deposit_tx_hash.as_deref())
        .await?;
    Ok(Json(task))
}

pub async fn escrow_tx(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> LifecycleResult<impl IntoResponse> {
    let body: EscrowTxBody = parse_body(&body)?;
    let task = state
        .lifecycle
        .set_escrow_tx(&task_id, body.tx_hash.as_deref())?;
    Ok(Json(task))
}

pub async fn proof(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> LifecycleResult<impl IntoResponse> {
    let input: SubmitProofInput = parse_body(&body)?;
    let (task, proof) = state.lifecycle.submit_proof(&task_id, input)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "task": task, "proof": proof })),
    ))
}

pub async fn verify(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> LifecycleResult<impl IntoResponse> {
    let input: VerifyInput = parse_body(&body)?;
    Ok(Json(state.lifecycle.verify(&task_id, input).await?))
}

pub async fn refund(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> LifecycleResult<impl IntoResponse> {
    Ok(Json(state.lifecycle.refund(&task_id).await?))
}

pub async fn poll(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> LifecycleResult<impl IntoResponse> {
    let raw = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| LifecycleError::missing_field("status"))?;
    let target = parse_status(raw)?;
    Ok(Json(state.lifecycle.poll(&task_id, target)?))
}
