//! Naming of uploaded restore artifacts
//!
//! Client filenames are reduced to `[A-Za-z0-9._-]`, checked against the
//! extensions accepted by the restore they feed, and prefixed with a sortable
//! timestamp.

use chrono::{DateTime, Utc};

/// Which restore an upload feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// SQL dump for `restore-db-file`
    Database,
    /// Files archive for `restore-files-file`
    Files,
}

impl UploadKind {
    /// Accepted filename suffixes
    pub fn allowed_suffixes(&self) -> &'static [&'static str] {
        match self {
            UploadKind::Database => &[".sql", ".sql.gz", ".gz"],
            UploadKind::Files => &[".tar", ".gz", ".tgz", ".zip", ".tar.gz"],
        }
    }

    /// Message shown when an upload is rejected
    pub fn rejection_message(&self) -> &'static str {
        match self {
            UploadKind::Database => "Invalid DB backup file. Use .sql or .sql.gz.",
            UploadKind::Files => "Invalid files archive. Use .tar.gz, .tgz, or .zip.",
        }
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`
pub fn sanitize_file_name(client_name: &str) -> String {
    client_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Whether a sanitized name carries one of the kind's extensions
pub fn has_allowed_extension(name: &str, kind: UploadKind) -> bool {
    let lower = name.to_lowercase();
    kind.allowed_suffixes()
        .iter()
        .any(|suffix| lower.len() > suffix.len() && lower.ends_with(suffix))
}

/// Stored name for an upload received at `timestamp`, or `None` if rejected
pub fn upload_file_name_with_time(
    client_name: &str,
    kind: UploadKind,
    timestamp: DateTime<Utc>,
) -> Option<String> {
    let safe = sanitize_file_name(client_name.trim());
    if safe.is_empty() || !has_allowed_extension(&safe, kind) {
        return None;
    }

    Some(format!("{}-{}", timestamp.format("%Y%m%d%H%M%S"), safe))
}

/// Stored name for an upload received now
pub fn upload_file_name(client_name: &str, kind: UploadKind) -> Option<String> {
    upload_file_name_with_time(client_name, kind, Utc::now())
}
