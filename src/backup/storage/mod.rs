//! Storage seams of the backup console
//!
//! Uploaded restore artifacts are kept on the local filesystem until the
//! engine consumes them; the remote bucket is only ever probed for
//! reachability, all transfers are left to the engine.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::backup::Result;
use crate::backup::upload_naming::UploadKind;
use crate::db::BackupSettings;

pub mod b2_storage;
pub mod local_storage;

/// Receives uploaded restore artifacts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Validate the client filename and move the staged upload into place
    ///
    /// `staged` is the file the request body was streamed into. Returns the
    /// absolute path the engine should restore from.
    async fn store(&self, kind: UploadKind, client_name: String, staged: PathBuf)
    -> Result<PathBuf>;
}

/// Checks that the configured bucket is reachable with the stored credentials
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BucketProbe: Send + Sync {
    async fn check(&self, settings: &BackupSettings) -> Result<()>;
}
