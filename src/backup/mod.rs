//! Backup orchestration: environment resolution, engine supervision,
//! job status tracking and schedule management for the external backup engine.

pub mod components;
pub mod db_env;
pub mod monitor;
pub mod runtime_env;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod supervisor;
pub mod upload_naming;

/// Default B2 region used when settings leave it blank
pub const DEFAULT_REGION: &str = "us-west-004";

/// Log file written by backup jobs and the scheduled runner
pub const BACKUP_LOG_FILE: &str = "backup-manager.log";

/// Log file written by restore jobs
pub const RESTORE_LOG_FILE: &str = "backup-restore.log";

/// Longest output excerpt surfaced to the user for a failed engine call
pub const OUTPUT_EXCERPT_LIMIT: usize = 300;

/// Error type for backup orchestration
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Configure Backblaze key ID, application key, and backup path first.")]
    ConfigurationIncomplete,

    #[error("Backup manager script not found: {}", .0.display())]
    EngineNotFound(std::path::PathBuf),

    #[error("Failed to launch job: {0}")]
    LaunchFailure(String),

    #[error("Engine exited with code {code}: {excerpt}")]
    EngineFailure { code: i32, excerpt: String },

    #[error("Invalid upload: {0}")]
    UploadInvalid(String),

    #[error("Schedule update failed: {0}")]
    ScheduleOperationFailure(String),

    #[error("A backup job is already running")]
    JobAlreadyRunning,

    #[error("{0}")]
    Validation(String),

    #[error("Settings store error: {0}")]
    Settings(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for BackupError {
    fn from(error: sqlx::Error) -> Self {
        BackupError::Settings(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BackupError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        BackupError::Settings(error.to_string())
    }
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Trim output and cut it down to a user-presentable excerpt
pub fn output_excerpt(output: &str) -> String {
    let trimmed = output.trim();
    match trimmed.char_indices().nth(OUTPUT_EXCERPT_LIMIT) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}
