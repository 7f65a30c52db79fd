//! Local filesystem store for uploaded restore artifacts

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs as tokio_fs;
use tracing::info;

use crate::backup::upload_naming::{UploadKind, upload_file_name};
use crate::backup::{BackupError, Result};
use crate::config::AppConfig;

use super::UploadStore;

/// Keeps uploads under `tmp/backups/uploads` of the application root
pub struct LocalUploadStore {
    upload_dir: PathBuf,
}

impl LocalUploadStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            upload_dir: config.uploads_dir(),
        }
    }

    /// Absolute upload directory, so the engine sees a stable path
    fn absolute_dir(&self) -> Result<PathBuf> {
        if self.upload_dir.is_absolute() {
            Ok(self.upload_dir.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.upload_dir))
        }
    }
}

#[async_trait]
impl UploadStore for LocalUploadStore {
    async fn store(
        &self,
        kind: UploadKind,
        client_name: String,
        staged: PathBuf,
    ) -> Result<PathBuf> {
        let file_name = upload_file_name(&client_name, kind)
            .ok_or_else(|| BackupError::UploadInvalid(kind.rejection_message().to_string()))?;
        let size = tokio_fs::metadata(&staged).await?.len();
        if size == 0 {
            return Err(BackupError::UploadInvalid(format!(
                "{} is empty",
                client_name.trim()
            )));
        }

        let dir = self.absolute_dir()?;
        if !dir.exists() {
            tokio_fs::create_dir_all(&dir).await?;
        }

        let target = dir.join(&file_name);
        if tokio_fs::rename(&staged, &target).await.is_err() {
            // Staged on another filesystem
            tokio_fs::copy(&staged, &target).await?;
            tokio_fs::remove_file(&staged).await?;
        }

        info!(path = %target.display(), size, "stored uploaded artifact");
        Ok(target)
    }
}
