//! Job status tracking
//!
//! A job is running exactly when the lock marker exists and names a live
//! process. Stale markers left behind by crashed jobs are removed on sight.

use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};
use tempfile::NamedTempFile;
use tokio::fs as tokio_fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

use crate::backup::Result;

/// Marker the engine prints at the start of every run
pub const RUN_START_MARKER: &str = "Backup start:";

/// Bytes kept before the run marker so the run's header line stays visible
const RUN_MARKER_LEAD: usize = 40;

/// Lines of log returned to status polls
pub const STATUS_TAIL_LINES: usize = 120;

/// Lines of log shown on the overview page
pub const OVERVIEW_TAIL_LINES: usize = 200;

/// Largest window read from the end of a log file
const TAIL_READ_WINDOW: u64 = 512 * 1024;

/// Whether `pid` names a process that has not exited
///
/// Zombies count as dead: their job is over even if nobody reaped them yet.
pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
        return false;
    }

    system.process(pid).is_some_and(|process| {
        !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
    })
}

/// On-disk marker of the in-flight job, holding its PID
#[derive(Debug, Clone)]
pub struct LockHandle {
    path: PathBuf,
}

impl LockHandle {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_pid(&self) -> Option<i64> {
        let contents = tokio_fs::read_to_string(&self.path).await.ok()?;
        Some(contents.trim().parse::<i64>().unwrap_or(0))
    }

    async fn clear_stale(&self, pid: i64) {
        info!(pid, path = %self.path.display(), "removing stale lock marker");
        if let Err(e) = tokio_fs::remove_file(&self.path).await {
            debug!(path = %self.path.display(), error = %e, "stale lock marker not removed");
        }
    }

    /// Whether the marker names a live process; stale markers are deleted
    pub async fn is_alive(&self) -> bool {
        let Some(pid) = self.read_pid().await else {
            return false;
        };

        if pid <= 0 || pid > u32::MAX as i64 {
            self.clear_stale(pid).await;
            return false;
        }

        if !process_alive(pid as u32) {
            self.clear_stale(pid).await;
            return false;
        }

        true
    }

    /// Write `pid` into a staged file next to the marker and move it into place
    ///
    /// Without `replace` the move fails when a marker exists, so of two
    /// concurrent claims only one lands. Readers never see a half-written
    /// marker either way.
    fn write_marker(&self, pid: u32, replace: bool) -> std::io::Result<bool> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(pid.to_string().as_bytes())?;
        staged.flush()?;

        if replace {
            staged.persist(&self.path).map_err(|e| e.error)?;
            return Ok(true);
        }
        match staged.persist_noclobber(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error),
        }
    }

    /// Claim the marker for `pid` unless a live job already holds it
    pub async fn try_acquire(&self, pid: u32) -> Result<bool> {
        if self.is_alive().await {
            return Ok(false);
        }
        Ok(self.write_marker(pid, false)?)
    }

    /// Point an already claimed marker at `pid`
    pub async fn record(&self, pid: u32) -> Result<()> {
        self.write_marker(pid, true)?;
        Ok(())
    }

    /// Remove the marker if present
    pub async fn release(&self) -> Result<()> {
        match tokio_fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read model polled by the control surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub running: bool,
    pub recent_log: String,
    pub current_run_log: String,
}

/// Last `lines` lines of a log file, empty when it cannot be read
pub async fn tail_lines(path: &Path, lines: usize) -> String {
    let Ok(mut file) = tokio_fs::File::open(path).await else {
        return String::new();
    };
    let Ok(metadata) = file.metadata().await else {
        return String::new();
    };

    let len = metadata.len();
    let start = len.saturating_sub(TAIL_READ_WINDOW);
    if file.seek(SeekFrom::Start(start)).await.is_err() {
        return String::new();
    }

    let mut bytes = Vec::with_capacity((len - start) as usize);
    if file.read_to_end(&mut bytes).await.is_err() {
        return String::new();
    }

    let text = String::from_utf8_lossy(&bytes);
    let mut all: Vec<&str> = text.split_inclusive('\n').collect();
    // The window may begin mid-line
    if start > 0 && !all.is_empty() {
        all.remove(0);
    }

    let skip = all.len().saturating_sub(lines);
    all[skip..].concat()
}

/// Portion of the log belonging to the latest run
pub fn current_run_log(recent_log: &str) -> String {
    if recent_log.trim().is_empty() {
        return String::new();
    }

    match recent_log.rfind(RUN_START_MARKER) {
        Some(pos) => {
            let mut start = pos.saturating_sub(RUN_MARKER_LEAD);
            while !recent_log.is_char_boundary(start) {
                start -= 1;
            }
            recent_log[start..].to_string()
        }
        None => recent_log.to_string(),
    }
}

/// Answers "is a job running" and "what did it print so far"
pub struct JobMonitor {
    lock: LockHandle,
    log_path: PathBuf,
}

impl JobMonitor {
    pub fn new(lock: LockHandle, log_path: PathBuf) -> Self {
        Self { lock, log_path }
    }

    pub async fn is_running(&self) -> bool {
        self.lock.is_alive().await
    }

    pub async fn recent_log(&self, lines: usize) -> String {
        tail_lines(&self.log_path, lines).await
    }

    pub async fn status(&self) -> JobStatus {
        let recent_log = self.recent_log(STATUS_TAIL_LINES).await;
        let current_run_log = current_run_log(&recent_log);

        JobStatus {
            running: self.is_running().await,
            recent_log,
            current_run_log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_marker_means_not_running() {
        let dir = tempdir().unwrap();
        let lock = LockHandle::new(dir.path().join(".lock"));
        assert!(!lock.is_alive().await);
    }

    #[tokio::test]
    async fn test_stale_marker_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".lock");
        // Above the kernel's pid_max, so never a live process
        tokio_fs::write(&path, "4194305").await.unwrap();

        let lock = LockHandle::new(path.clone());
        assert!(!lock.is_alive().await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_garbage_marker_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".lock");
        tokio_fs::write(&path, "not-a-pid\n").await.unwrap();

        let lock = LockHandle::new(path.clone());
        assert!(!lock.is_alive().await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_live_marker_reports_running() {
        let dir = tempdir().unwrap();
        let lock = LockHandle::new(dir.path().join("nested").join(".lock"));

        assert!(lock.try_acquire(std::process::id()).await.unwrap());
        assert!(lock.is_alive().await);
        assert!(!lock.try_acquire(std::process::id()).await.unwrap());

        lock.release().await.unwrap();
        assert!(!lock.is_alive().await);
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_try_acquire_replaces_stale_marker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".lock");
        tokio_fs::write(&path, "0").await.unwrap();

        let lock = LockHandle::new(path.clone());
        assert!(lock.try_acquire(std::process::id()).await.unwrap());
        let stored = tokio_fs::read_to_string(&path).await.unwrap();
        assert_eq!(stored, std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_record_repoints_claimed_marker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".lock");
        let lock = LockHandle::new(path.clone());

        assert!(lock.try_acquire(std::process::id()).await.unwrap());
        lock.record(4194305).await.unwrap();
        assert_eq!(tokio_fs::read_to_string(&path).await.unwrap(), "4194305");
        // Only the marker itself is left in the directory
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".lock");
        let first = LockHandle::new(path.clone());
        let second = LockHandle::new(path.clone());
        let pid = std::process::id();

        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.try_acquire(pid).await.unwrap() }),
            tokio::spawn(async move { second.try_acquire(pid).await.unwrap() }),
        );
        assert!(a.unwrap() ^ b.unwrap());
        assert!(LockHandle::new(path).is_alive().await);
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(4194305));
    }

    #[tokio::test]
    async fn test_tail_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.log");
        let body: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        tokio_fs::write(&path, body).await.unwrap();

        assert_eq!(tail_lines(&path, 2).await, "line 9\nline 10\n");
        assert_eq!(tail_lines(&path, 50).await.lines().count(), 10);
        assert_eq!(tail_lines(&dir.path().join("absent.log"), 5).await, "");
    }

    #[test]
    fn test_current_run_log_starts_near_last_marker() {
        let log = format!(
            "old output\n[2026-01-01 00:00:00] {} full\nold run finished with many lines of output\n[2026-01-02 00:00:00] {} db\nnew run\n",
            RUN_START_MARKER, RUN_START_MARKER
        );
        let current = current_run_log(&log);

        assert!(current.ends_with("Backup start: db\nnew run\n"));
        assert!(!current.contains("old run"));
        let pos = log.rfind(RUN_START_MARKER).unwrap();
        assert_eq!(current.len(), log.len() - (pos - RUN_MARKER_LEAD));
    }

    #[test]
    fn test_current_run_log_without_marker_returns_everything() {
        assert_eq!(current_run_log("a\nb\n"), "a\nb\n");
        assert_eq!(current_run_log("  \n"), "");
        assert_eq!(current_run_log("Backup start: x"), "Backup start: x");
    }

    #[tokio::test]
    async fn test_status_combines_lock_and_log() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("backup-manager.log");
        tokio_fs::write(&log_path, "prep\nBackup start: full\nuploading\n")
            .await
            .unwrap();

        let monitor = JobMonitor::new(LockHandle::new(dir.path().join(".lock")), log_path);
        let status = monitor.status().await;

        assert!(!status.running);
        assert_eq!(status.recent_log, "prep\nBackup start: full\nuploading\n");
        assert_eq!(status.current_run_log, "prep\nBackup start: full\nuploading\n");
    }
}
