//! Multipart proof uploads.

use axum::{
    Json,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartRejection},
    response::IntoResponse,
};
use serde_json::json;

use super::AppState;
use crate::blobs::{BlobStore, UploadedFile};
use crate::error::{LifecycleError, LifecycleResult};

pub(super) fn body_limit(blobs: &BlobStore) -> DefaultBodyLimit {
    DefaultBodyLimit::max(blobs.max_request_bytes())
}

fn malformed(reason: String) -> LifecycleError {
    LifecycleError::invalid_value("files", reason)
}

/// `taskId` plus one or more `files` parts. Returns `{urls}`.
pub async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> LifecycleResult<impl IntoResponse> {
    let mut multipart = multipart.map_err(|e| malformed(e.body_text()))?;

    let mut task_id = None;
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| malformed(e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("taskId") => {
                task_id = Some(field.text().await.map_err(|e| malformed(e.body_text()))?);
            }
            Some("files") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field.bytes().await.map_err(|e| malformed(e.body_text()))?;
                files.push(UploadedFile {
                    name: file_name,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    let task_id = task_id.ok_or_else(|| LifecycleError::missing_field("taskId"))?;
    let task_id = state.lifecycle.load(task_id.trim())?.id;

    let blobs = state.blobs.clone();
    let keys = tokio::task::spawn_blocking(move || blobs.store(&task_id, &files))
        .await
        .map_err(LifecycleError::internal)??;

    let urls: Vec<String> = keys.iter().map(|key| format!("/blobs/{}", key)).collect();
    Ok(Json(json!({ "urls": urls })))
}
