//! Backup orchestration service
//!
//! Every operation re-reads the settings record and builds a fresh runtime
//! environment before handing an argument vector to the engine runner.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::backup::components::{
    BackupSet, normalize_file_components, normalize_restore_components, parse_backup_sets,
    selected_file_components,
};
use crate::backup::db_env::{DbEnvResolver, EnvLookup, LiveConnection, ProcessEnv};
use crate::backup::monitor::{JobMonitor, JobStatus, LockHandle, OVERVIEW_TAIL_LINES};
use crate::backup::runtime_env::{EnvContext, RuntimeEnv, build_runtime_env, site_url};
use crate::backup::scheduler::Scheduler;
use crate::backup::storage::{BucketProbe, UploadStore};
use crate::backup::supervisor::{CommandOutput, EngineRunner, JobLog};
use crate::backup::upload_naming::UploadKind;
use crate::backup::{BackupError, Result};
use crate::config::AppConfig;
use crate::db::{BackupSettings, SettingsForm, SettingsRepository};

/// Environment variable naming the site's public domain
const ACCOUNT_DOMAIN_VAR: &str = "ACCOUNT_DOMAIN";

/// Set id the engine resolves to the newest snapshot set
const LATEST_SET: &str = "latest";

/// Backup flavours the engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Db,
    Files,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Db => "db",
            BackupType::Files => "files",
        }
    }

    /// Whether the engine takes a `--components` selection for this type
    fn takes_components(&self) -> bool {
        matches!(self, BackupType::Full | BackupType::Files)
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "full" => Ok(BackupType::Full),
            "db" => Ok(BackupType::Db),
            "files" => Ok(BackupType::Files),
            _ => Err(BackupError::Validation(
                "Invalid backup type selected.".to_string(),
            )),
        }
    }
}

/// Reply to a request that starts a background job
#[derive(Debug, Clone, Serialize)]
pub struct JobStarted {
    pub started: bool,
    pub message: String,
}

impl JobStarted {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            started: true,
            message: message.into(),
        }
    }
}

/// Reply to a synchronous request
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub ok: bool,
    pub message: String,
}

/// A remote set with its display label
#[derive(Debug, Clone, Serialize)]
pub struct BackupSetOption {
    #[serde(flatten)]
    pub set: BackupSet,
    pub label: String,
}

impl From<BackupSet> for BackupSetOption {
    fn from(set: BackupSet) -> Self {
        let label = set.label();
        Self { set, label }
    }
}

/// Everything the index page shows
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub settings: BackupSettings,
    pub configured: bool,
    pub selected_file_components: Vec<String>,
    pub snapshots_output: String,
    pub snapshots_exit_code: i32,
    pub backup_sets: Vec<BackupSetOption>,
    pub schedule_output: String,
    pub recent_log: String,
}

/// Result of a scheduled tick
#[derive(Debug)]
pub enum ScheduledRun {
    /// The schedule is switched off; nothing ran
    Disabled,
    Completed(CommandOutput),
}

/// Crontab output of a failed schedule change, without the error's own prefix
fn schedule_failure_detail(error: BackupError) -> String {
    match error {
        BackupError::ScheduleOperationFailure(output) => output,
        other => other.to_string(),
    }
}

/// Orchestrates engine jobs against the stored settings
pub struct BackupService {
    config: AppConfig,
    settings: Arc<dyn SettingsRepository>,
    engine: Arc<dyn EngineRunner>,
    scheduler: Scheduler,
    uploads: Arc<dyn UploadStore>,
    monitor: JobMonitor,
    probe: Option<Arc<dyn BucketProbe>>,
    live: Option<Arc<dyn LiveConnection>>,
    env: Arc<dyn EnvLookup>,
}

impl BackupService {
    pub fn new(
        config: AppConfig,
        settings: Arc<dyn SettingsRepository>,
        engine: Arc<dyn EngineRunner>,
        scheduler: Scheduler,
        uploads: Arc<dyn UploadStore>,
    ) -> Self {
        let monitor = JobMonitor::new(LockHandle::new(config.lock_path()), config.backup_log_path());
        Self {
            config,
            settings,
            engine,
            scheduler,
            uploads,
            monitor,
            probe: None,
            live: None,
            env: Arc::new(ProcessEnv),
        }
    }

    /// Probe the bucket before running the engine's `list` on validation
    pub fn with_bucket_probe(mut self, probe: Arc<dyn BucketProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Prefer the host application's live datasource for DB facts
    pub fn with_live_connection(mut self, live: Arc<dyn LiveConnection>) -> Self {
        self.live = Some(live);
        self
    }

    pub fn with_env(mut self, env: Arc<dyn EnvLookup>) -> Self {
        self.env = env;
        self
    }

    fn runtime_env(&self, settings: &BackupSettings) -> RuntimeEnv {
        let live = self.live.as_ref().map(|l| l.as_ref() as &dyn LiveConnection);
        let db = DbEnvResolver::new(live, self.env.as_ref(), &self.config.datasource).resolve();
        let account_domain = self.env.var(ACCOUNT_DOMAIN_VAR);
        let site = site_url(self.config.base_url.as_deref(), account_domain.as_deref());

        build_runtime_env(
            settings,
            &EnvContext {
                salt: &self.config.security_salt,
                site_url: &site,
                db: &db,
            },
        )
    }

    async fn configured_settings(&self) -> Result<BackupSettings> {
        match self.settings.get().await? {
            Some(settings) if settings.has_required_settings() => Ok(settings),
            _ => Err(BackupError::ConfigurationIncomplete),
        }
    }

    async fn run_engine(&self, args: &[&str], env: RuntimeEnv) -> Result<CommandOutput> {
        let args = args.iter().map(|a| a.to_string()).collect();
        self.engine.run(args, env).await
    }

    /// Settings, remote listings, installed schedule and the recent backup log
    pub async fn overview(&self) -> Result<Overview> {
        let stored = self.settings.get().await?;
        let configured = stored.as_ref().is_some_and(|s| s.has_required_settings());
        let settings = stored.unwrap_or_default();

        let mut snapshots_output =
            String::from("Configure Backblaze keys and backup path below to enable snapshots.");
        let mut snapshots_exit_code = 0;
        let mut backup_sets = Vec::new();

        if configured {
            let (list, sets) = futures::join!(
                self.run_engine(&["list"], self.runtime_env(&settings)),
                self.run_engine(&["list-sets"], self.runtime_env(&settings)),
            );

            match list {
                Ok(output) => {
                    snapshots_exit_code = output.exit_code;
                    snapshots_output = output.output;
                }
                Err(e) => {
                    snapshots_exit_code = -1;
                    snapshots_output = e.to_string();
                }
            }
            match sets {
                Ok(output) if output.success() => {
                    backup_sets = parse_backup_sets(&output.output)
                        .into_iter()
                        .map(BackupSetOption::from)
                        .collect();
                }
                Ok(output) => warn!(exit_code = output.exit_code, "list-sets failed"),
                Err(e) => warn!(error = %e, "list-sets failed"),
            }
        }

        Ok(Overview {
            selected_file_components: selected_file_components(&settings.backup_components),
            settings,
            configured,
            snapshots_output,
            snapshots_exit_code,
            backup_sets,
            schedule_output: self.scheduler.installed_lines().await,
            recent_log: self.monitor.recent_log(OVERVIEW_TAIL_LINES).await,
        })
    }

    /// Start `backup <type> --prune [--components=..]` in the background
    pub async fn run_backup(&self, backup_type: &str, components: &[String]) -> Result<JobStarted> {
        let backup_type: BackupType = backup_type.parse()?;
        let settings = self.configured_settings().await?;

        let mut selected = normalize_file_components(components);
        if selected.is_empty() {
            selected = selected_file_components(&settings.backup_components);
        }

        let mut args = vec![
            "backup".to_string(),
            backup_type.as_str().to_string(),
            "--prune".to_string(),
        ];
        if backup_type.takes_components() && !selected.is_empty() {
            args.push(format!("--components={}", selected.join(",")));
        }

        self.engine
            .launch(args, self.runtime_env(&settings), JobLog::Backup)
            .await?;
        info!(backup_type = backup_type.as_str(), "backup job started");

        Ok(JobStarted::ok(format!(
            "Backup job started for type: {}",
            backup_type.as_str().to_uppercase()
        )))
    }

    /// Restore selected components of one remote set
    pub async fn restore_set(&self, set_id: &str, components: &[String]) -> Result<JobStarted> {
        let settings = self.configured_settings().await?;

        let set_id = set_id.trim();
        let components = normalize_restore_components(components);
        if set_id.is_empty() || components.is_empty() {
            return Err(BackupError::Validation(
                "Select a backup set and at least one restore component.".to_string(),
            ));
        }

        let args = vec![
            "restore-set".to_string(),
            set_id.to_string(),
            components.join(","),
        ];
        self.engine
            .launch(args, self.runtime_env(&settings), JobLog::Restore)
            .await?;
        info!(set_id, "set restore started");

        Ok(JobStarted::ok(
            "Restore started. Existing local folders/files will be archived as old-* before replacement. Check restore log for health check PASS/FAIL.",
        ))
    }

    /// One-click restore of files and database, defaulting to the latest set
    pub async fn restore_full(
        &self,
        set_id: Option<&str>,
        include_env_files: bool,
    ) -> Result<JobStarted> {
        let settings = self.configured_settings().await?;

        let set_id = set_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(LATEST_SET);

        let mut env = self.runtime_env(&settings);
        env.set("RESTORE_REWRITE_URLS", "1");
        env.set("RESTORE_RUN_COMPOSER", "1");
        env.set("RESTORE_RUN_MIGRATIONS", "1");
        env.set("RESTORE_CLEAR_CACHE", "1");
        env.set(
            "RESTORE_INCLUDE_ENV_FILES",
            if include_env_files { "1" } else { "0" },
        );

        let args = vec!["restore-full".to_string(), set_id.to_string()];
        self.engine.launch(args, env, JobLog::Restore).await?;
        info!(set_id, include_env_files, "full restore started");

        Ok(JobStarted::ok(
            "One-click full restore started. This restores app files + DB, rewrites URLs, runs composer and migrations, clears cache, and runs health checks.",
        ))
    }

    /// Restore the database from an uploaded dump
    pub async fn restore_db_file(&self, client_name: &str, staged: &Path) -> Result<JobStarted> {
        let settings = self.configured_settings().await?;
        let path = self
            .uploads
            .store(UploadKind::Database, client_name.to_string(), staged.to_path_buf())
            .await?;

        let args = vec![
            "restore-db-file".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        self.engine
            .launch(args, self.runtime_env(&settings), JobLog::Restore)
            .await?;
        info!(path = %path.display(), "database restore started");

        Ok(JobStarted::ok("DB restore started from uploaded file."))
    }

    /// Restore files from an uploaded archive into `target_dir`
    pub async fn restore_files_file(
        &self,
        client_name: &str,
        staged: &Path,
        target_dir: &str,
    ) -> Result<JobStarted> {
        let target_dir = target_dir.trim();
        if target_dir.is_empty() {
            return Err(BackupError::Validation(
                "Target directory is required for file restore.".to_string(),
            ));
        }

        let settings = self.configured_settings().await?;
        let path = self
            .uploads
            .store(UploadKind::Files, client_name.to_string(), staged.to_path_buf())
            .await?;

        let args = vec![
            "restore-files-file".to_string(),
            path.to_string_lossy().into_owned(),
            target_dir.to_string(),
        ];
        self.engine
            .launch(args, self.runtime_env(&settings), JobLog::Restore)
            .await?;
        info!(path = %path.display(), target_dir, "file restore started");

        Ok(JobStarted::ok("File restore started from uploaded archive."))
    }

    /// Check the bucket and that the engine can list the repository
    pub async fn validate(&self) -> Result<Notice> {
        let settings = self.configured_settings().await?;

        if let Some(probe) = &self.probe {
            probe.check(&settings).await?;
        }

        let output = self.run_engine(&["list"], self.runtime_env(&settings)).await?;
        if !output.success() && output.output.trim().is_empty() {
            return Err(BackupError::Validation(
                "Validation failed. Check credentials, backup path, and server access.".to_string(),
            ));
        }
        output.into_result()?;

        Ok(Notice {
            ok: true,
            message: "Backup settings validated successfully.".to_string(),
        })
    }

    /// Remote sets reported by the engine
    pub async fn backup_sets(&self) -> Result<Vec<BackupSetOption>> {
        let settings = self.configured_settings().await?;
        let output = self
            .run_engine(&["list-sets"], self.runtime_env(&settings))
            .await?
            .into_result()?;

        Ok(parse_backup_sets(&output)
            .into_iter()
            .map(BackupSetOption::from)
            .collect())
    }

    pub async fn status(&self) -> JobStatus {
        self.monitor.status().await
    }

    /// Persist submitted settings and bring the schedule in line with them
    ///
    /// A failed schedule update is reported in the notice; the settings stay saved.
    pub async fn save_settings(&self, form: SettingsForm) -> Result<Notice> {
        let current = self.settings.get().await?.unwrap_or_default();
        let next = current.patched(form).map_err(|e| match e {
            BackupError::Validation(msg) => {
                BackupError::Validation(format!("Failed to save backup settings. {}", msg))
            }
            other => other,
        })?;
        let saved = self.settings.save(&next).await?;

        if !saved.has_required_settings() {
            return Ok(Notice {
                ok: true,
                message: "Settings saved. Add Backblaze key ID, application key, and backup path to enable backups.".to_string(),
            });
        }

        let notice = if saved.schedule_enabled {
            match self.scheduler.install(&saved).await {
                Ok(output) => Notice {
                    ok: true,
                    message: format!("Settings saved and schedule updated. {}", output)
                        .trim_end()
                        .to_string(),
                },
                Err(e) => Notice {
                    ok: false,
                    message: format!(
                        "Settings saved but schedule update failed. {}",
                        schedule_failure_detail(e)
                    ),
                },
            }
        } else {
            match self.scheduler.remove().await {
                Ok(_) => Notice {
                    ok: true,
                    message: "Settings saved and schedule removed.".to_string(),
                },
                Err(e) => Notice {
                    ok: false,
                    message: format!(
                        "Settings saved, but failed to remove schedule. {}",
                        schedule_failure_detail(e)
                    ),
                },
            }
        };

        if !notice.ok {
            warn!(message = %notice.message, "schedule update failed");
        }
        Ok(notice)
    }

    /// One scheduled tick: a full backup with pruning, in the foreground
    pub async fn run_scheduled(&self) -> Result<ScheduledRun> {
        let Some(settings) = self.settings.get().await? else {
            return Err(BackupError::Settings("No backup settings found.".to_string()));
        };
        if !settings.schedule_enabled {
            return Ok(ScheduledRun::Disabled);
        }
        if !settings.has_required_settings() {
            return Err(BackupError::ConfigurationIncomplete);
        }

        let output = self
            .run_engine(&["backup", "full", "--prune"], self.runtime_env(&settings))
            .await?;
        info!(exit_code = output.exit_code, "scheduled backup finished");
        Ok(ScheduledRun::Completed(output))
    }
}
