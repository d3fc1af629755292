//! HTTP shell over the lifecycle.
//!
//! Handlers parse requests, call into [`Lifecycle`], and serialize the result.
//! Every failure leaves through [`LifecycleError`]'s `IntoResponse`, so status
//! codes follow the error kind.

mod ledger;
mod providers;
mod tasks;
mod uploads;

use axum::{
    Json, Router,
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::blobs::BlobStore;
use crate::chain::MemoryLedger;
use crate::error::{ErrorKind, LifecycleError, LifecycleResult};
use crate::lifecycle::Lifecycle;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Lifecycle,
    pub blobs: Arc<BlobStore>,
    /// In-process ledger, present only in memory chain mode.
    pub ledger: Option<Arc<MemoryLedger>>,
}

impl AppState {
    pub fn new(lifecycle: Lifecycle, blobs: BlobStore) -> Self {
        Self {
            lifecycle,
            blobs: Arc::new(blobs),
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Option<Arc<MemoryLedger>>) -> Self {
        self.ledger = ledger;
        self
    }
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if matches!(
            self.kind(),
            ErrorKind::Chain | ErrorKind::Persistence | ErrorKind::Internal
        ) {
            error!(code = ?self.code, error = %self.message, "request failed");
        }

        let mut body = serde_json::json!({
            "error": self.message,
            "code": self.code,
        });
        if let Some(field) = self.field {
            body["field"] = field.into();
        }
        if let Some(details) = self.details {
            body["details"] = details.into();
        }
        (status, Json(body)).into_response()
    }
}

/// Parse an optional JSON body. An empty body yields `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> LifecycleResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        LifecycleError::new(
            crate::error::ErrorCode::InvalidFieldValue,
            format!("Invalid JSON body: {}", e),
        )
    })
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let blobs = ServeDir::new(state.blobs.root());

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/tasks", get(tasks::list).post(tasks::create))
        .route("/tasks/{task_id}", get(tasks::detail))
        .route("/tasks/{task_id}/claim", post(tasks::claim))
        .route("/tasks/{task_id}/match", post(tasks::match_provider))
        .route("/tasks/{task_id}/accept", post(tasks::accept))
        .route("/tasks/{task_id}/fund", post(tasks::fund))
        .route("/tasks/{task_id}/escrow-tx", post(tasks::escrow_tx))
        .route("/tasks/{task_id}/proof", post(tasks::proof))
        .route("/tasks/{task_id}/verify", post(tasks::verify))
        .route("/tasks/{task_id}/refund", post(tasks::refund))
        .route("/tasks/{task_id}/poll", get(tasks::poll))
        .route("/providers", get(providers::list).post(providers::create))
        .route("/upload", post(uploads::upload))
        .nest_service("/blobs", blobs);

    if state.ledger.is_some() {
        router = router.route("/ledger/deposits", post(ledger::deposit));
    }

    router
        .layer(uploads::body_limit(&state.blobs))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve in the background.
///
/// Returns a sender that triggers graceful shutdown and the bound address.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
) -> anyhow::Result<(oneshot::Sender<()>, SocketAddr)> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    info!("Task settlement API listening on http://{}", bound_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("API server shutting down");
            })
            .await
        {
            error!("API server error: {}", e);
        }
    });

    Ok((shutdown_tx, bound_addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn empty_body_is_default() {
        #[derive(Debug, Default, serde::Deserialize)]
        struct Body {
            #[serde(default)]
            notes: Option<String>,
        }
        let parsed: Body = parse_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(parsed.notes.is_none());

        let err = parse_body::<Body>(&Bytes::from_static(b"{not json")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFieldValue);
    }
}
