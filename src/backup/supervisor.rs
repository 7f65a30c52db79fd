//! Engine process supervision
//!
//! The engine is spawned from an argument vector with an explicit environment
//! map, so no value ever passes through shell interpolation. Synchronous calls
//! capture merged stdout/stderr and the exit code; background launches detach
//! into their own process group and append to a job log.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs as tokio_fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backup::monitor::LockHandle;
use crate::backup::runtime_env::RuntimeEnv;
use crate::backup::{output_excerpt, BackupError, Result, BACKUP_LOG_FILE, RESTORE_LOG_FILE};
use crate::config::{AppConfig, LockOwnership};

/// Which append-only log a background job writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLog {
    Backup,
    Restore,
}

impl JobLog {
    pub fn file_name(&self) -> &'static str {
        match self {
            JobLog::Backup => BACKUP_LOG_FILE,
            JobLog::Restore => RESTORE_LOG_FILE,
        }
    }
}

/// Result of a synchronous engine call
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// stdout and stderr, interleaved
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Output on success, otherwise an `EngineFailure` with a short excerpt
    pub fn into_result(self) -> Result<String> {
        if self.success() {
            Ok(self.output)
        } else {
            Err(BackupError::EngineFailure {
                code: self.exit_code,
                excerpt: output_excerpt(&self.output),
            })
        }
    }
}

/// Runs engine verbs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineRunner: Send + Sync {
    /// Run to completion and capture combined output
    async fn run(&self, args: Vec<String>, env: RuntimeEnv) -> Result<CommandOutput>;

    /// Start detached, appending output to `log`; returns once spawned
    async fn launch(&self, args: Vec<String>, env: RuntimeEnv, log: JobLog) -> Result<()>;
}

/// Spawns the engine executable as a child process
pub struct ProcessSupervisor {
    app_root: PathBuf,
    engine_path: PathBuf,
    interpreter: Option<String>,
    backup_log: PathBuf,
    restore_log: PathBuf,
    lock_ownership: LockOwnership,
    lock: LockHandle,
    /// Serializes claim and spawn of supervised launches
    launch_guard: Mutex<()>,
}

impl ProcessSupervisor {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            app_root: config.app_root.clone(),
            engine_path: config.engine_path.clone(),
            interpreter: config.engine_interpreter.clone(),
            backup_log: config.backup_log_path(),
            restore_log: config.restore_log_path(),
            lock_ownership: config.lock_ownership,
            lock: LockHandle::new(config.lock_path()),
            launch_guard: Mutex::new(()),
        }
    }

    fn log_path(&self, log: JobLog) -> &Path {
        match log {
            JobLog::Backup => &self.backup_log,
            JobLog::Restore => &self.restore_log,
        }
    }

    fn command(&self, args: &[String], env: &RuntimeEnv) -> Result<Command> {
        if !self.engine_path.is_file() {
            return Err(BackupError::EngineNotFound(self.engine_path.clone()));
        }

        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&self.engine_path);
                c
            }
            None => Command::new(&self.engine_path),
        };

        cmd.args(args)
            .current_dir(&self.app_root)
            .envs(env.iter())
            .stdin(Stdio::null());
        Ok(cmd)
    }

    async fn spawn_detached(
        &self,
        args: &[String],
        env: &RuntimeEnv,
        log: JobLog,
    ) -> Result<tokio::process::Child> {
        let mut cmd = self.command(args, env)?;

        let log_path = self.log_path(log);
        if let Some(dir) = log_path.parent() {
            tokio_fs::create_dir_all(dir).await?;
        }
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let stderr = stdout.try_clone()?;

        cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
        // Own process group: terminal and parent signals do not reach the job
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
            .map_err(|e| BackupError::LaunchFailure(e.to_string()))
    }
}

#[async_trait]
impl EngineRunner for ProcessSupervisor {
    async fn run(&self, args: Vec<String>, env: RuntimeEnv) -> Result<CommandOutput> {
        let mut cmd = self.command(&args, &env)?;

        // One file behind both streams keeps their interleaving intact
        let capture = tempfile::tempfile()?;
        cmd.stdout(Stdio::from(capture.try_clone()?))
            .stderr(Stdio::from(capture.try_clone()?));

        let status = cmd
            .status()
            .await
            .map_err(|e| BackupError::LaunchFailure(e.to_string()))?;

        let mut capture = tokio_fs::File::from_std(capture);
        capture.seek(SeekFrom::Start(0)).await?;
        let mut bytes = Vec::new();
        capture.read_to_end(&mut bytes).await?;

        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!(args = ?args, exit_code, "engine call failed");
        }

        Ok(CommandOutput {
            exit_code,
            output: String::from_utf8_lossy(&bytes).trim_end().to_string(),
        })
    }

    async fn launch(&self, args: Vec<String>, env: RuntimeEnv, log: JobLog) -> Result<()> {
        if self.lock_ownership == LockOwnership::Engine {
            let child = self.spawn_detached(&args, &env, log).await?;
            info!(args = ?args, pid = ?child.id(), log = log.file_name(), "engine job launched");
            // Dropped children keep running and are reaped by the runtime
            return Ok(());
        }

        let _guard = self.launch_guard.lock().await;

        // Claimed under the console's own pid until the child's is known
        if !self.lock.try_acquire(std::process::id()).await? {
            return Err(BackupError::JobAlreadyRunning);
        }

        let mut child = match self.spawn_detached(&args, &env, log).await {
            Ok(child) => child,
            Err(e) => {
                if let Err(release_err) = self.lock.release().await {
                    error!(path = %self.lock.path().display(), error = %release_err, "failed to release lock marker");
                }
                return Err(e);
            }
        };
        let pid = child.id();
        info!(args = ?args, pid = ?pid, log = log.file_name(), "engine job launched");

        match pid {
            Some(pid) => {
                if let Err(e) = self.lock.record(pid).await {
                    error!(pid, error = %e, "failed to record job pid in lock marker");
                }
            }
            None => warn!("launched job exited before its pid was recorded"),
        }

        // This launch owns the marker, so its reaper clears it
        let lock = self.lock.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(pid = ?pid, code = ?status.code(), "engine job finished"),
                Err(e) => error!(pid = ?pid, error = %e, "waiting for engine job failed"),
            }
            if let Err(e) = lock.release().await {
                error!(path = %lock.path().display(), error = %e, "failed to release lock marker");
            }
        });

        Ok(())
    }
}
