//! Filesystem store for uploaded proof artifacts.
//!
//! Files land under `<root>/<task_id>/<millis>-<rand>.<ext>`; the returned
//! keys are relative to the root and are served back under `/blobs/`.

use anyhow::Context;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::db::now_ms;
use crate::error::{ErrorCode, LifecycleError, LifecycleResult};

/// One file from a multipart upload.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    max_file_bytes: usize,
    max_files: usize,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, max_file_bytes: usize, max_files: usize) -> Self {
        Self {
            root: root.into(),
            max_file_bytes,
            max_files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Upper bound for a whole upload request body.
    pub fn max_request_bytes(&self) -> usize {
        self.max_file_bytes
            .saturating_mul(self.max_files)
            .saturating_add(64 * 1024)
    }

    /// Validate every file, then write them all. Returns the stored keys.
    pub fn store(&self, task_id: &str, files: &[UploadedFile]) -> LifecycleResult<Vec<String>> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(LifecycleError::missing_field("taskId"));
        }
        if !task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(LifecycleError::invalid_value(
                "taskId",
                "taskId may only contain letters, digits, '-' and '_'",
            ));
        }

        if files.is_empty() {
            return Err(LifecycleError::new(
                ErrorCode::MissingRequiredField,
                "At least one file is required",
            )
            .with_field("files"));
        }
        if files.len() > self.max_files {
            return Err(LifecycleError::invalid_value(
                "files",
                format!("Maximum {} files allowed", self.max_files),
            ));
        }
        for file in files {
            if file.bytes.len() > self.max_file_bytes {
                return Err(LifecycleError::invalid_value(
                    "files",
                    format!(
                        "File \"{}\" exceeds the {} byte limit",
                        file.name, self.max_file_bytes
                    ),
                ));
            }
        }

        let dir = self.root.join(task_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create blob directory {}", dir.display()))
            .map_err(|e| LifecycleError::internal(format!("{:#}", e)))?;

        let mut keys = Vec::with_capacity(files.len());
        for file in files {
            let name = blob_name(now_ms(), &file.name);
            let path = dir.join(&name);
            std::fs::write(&path, &file.bytes)
                .with_context(|| format!("Failed to write blob {}", path.display()))
                .map_err(|e| LifecycleError::internal(format!("{:#}", e)))?;

            debug!(task_id, path = %path.display(), bytes = file.bytes.len(), "stored blob");
            keys.push(format!("{}/{}", task_id, name));
        }
        Ok(keys)
    }
}

/// `<millis>-<6 random chars>.<ext>`; the extension comes from the original
/// name, sanitized, defaulting to `bin`.
fn blob_name(millis: i64, original: &str) -> String {
    let ext: String = original
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(10)
        .collect::<String>()
        .to_ascii_lowercase();
    let ext = if ext.is_empty() { "bin".to_string() } else { ext };

    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase();

    format!("{}-{}.{}", millis, suffix, ext)
}
