//! Periodic backup schedule kept in the user's crontab
//!
//! The entry is tagged with a fixed marker comment. Installing and removing
//! both rewrite the whole table with every marker line filtered out, so
//! repeated installs always leave exactly one entry.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backup::{BackupError, Result};
use crate::db::{BackupSettings, ScheduleFrequency};

/// Comment tagging the console's own crontab entry
pub const CRON_MARKER: &str = "# b2-backup-console-runner";

/// Persistent, line-oriented store of periodic jobs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Current table contents, empty when none exists
    async fn read(&self) -> Result<String>;

    /// Replace the table, returning the tool's output
    async fn write(&self, contents: String) -> Result<String>;
}

/// The invoking user's crontab, managed through the `crontab` tool
pub struct CrontabStore {
    program: String,
}

impl CrontabStore {
    pub fn new() -> Self {
        Self {
            program: String::from("crontab"),
        }
    }
}

#[async_trait]
impl ScheduleStore for CrontabStore {
    async fn read(&self) -> Result<String> {
        let output = Command::new(&self.program).arg("-l").output().await;

        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            // No crontab yet
            Ok(_) => Ok(String::new()),
            Err(e) => Err(BackupError::ScheduleOperationFailure(e.to_string())),
        }
    }

    async fn write(&self, contents: String) -> Result<String> {
        let mut child = Command::new(&self.program)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackupError::ScheduleOperationFailure(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim().to_string();

        if output.status.success() {
            Ok(text)
        } else {
            Err(BackupError::ScheduleOperationFailure(text))
        }
    }
}

/// Single-quote a value for the shell cron runs entries with
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Cron expression for the configured time and frequency
pub fn cron_expression(settings: &BackupSettings) -> String {
    let (hour, minute) = settings
        .schedule_time
        .split_once(':')
        .map(|(h, m)| {
            (
                h.trim().parse::<u32>().unwrap_or(0),
                m.trim().parse::<u32>().unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));

    match settings.schedule_frequency {
        ScheduleFrequency::Weekly => {
            format!("{} {} * * {}", minute, hour, settings.schedule_weekday)
        }
        ScheduleFrequency::Daily => format!("{} {} * * *", minute, hour),
    }
}

/// Drop every marker-tagged line and optionally append a replacement
pub fn replace_marker_lines(existing: &str, new_line: Option<&str>) -> String {
    let mut lines: Vec<&str> = existing
        .lines()
        .filter(|line| !line.contains(CRON_MARKER))
        .collect();
    if let Some(line) = new_line {
        lines.push(line);
    }

    let mut table = lines.join("\n");
    if !table.is_empty() {
        table.push('\n');
    }
    table
}

/// What the scheduled entry runs
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub app_root: PathBuf,
    pub executable: PathBuf,
    pub config_path: Option<PathBuf>,
    pub log_path: PathBuf,
    /// Variables set on the runner so it resolves the server's paths
    pub env: Vec<(String, String)>,
}

impl RunnerCommand {
    fn render(&self) -> String {
        let mut cmd = format!("cd {} && ", sh_quote(&self.app_root.to_string_lossy()));
        for (key, value) in &self.env {
            cmd.push_str(key);
            cmd.push('=');
            cmd.push_str(&sh_quote(value));
            cmd.push(' ');
        }
        cmd.push_str(&sh_quote(&self.executable.to_string_lossy()));
        if let Some(config) = &self.config_path {
            cmd.push_str(" --config ");
            cmd.push_str(&sh_quote(&config.to_string_lossy()));
        }
        cmd.push_str(" run-scheduled >> ");
        cmd.push_str(&sh_quote(&self.log_path.to_string_lossy()));
        cmd.push_str(" 2>&1");
        cmd
    }
}

/// Installs and removes the console's crontab entry
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    runner: RunnerCommand,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, runner: RunnerCommand) -> Self {
        Self { store, runner }
    }

    /// Full crontab line for the given settings
    pub fn schedule_line(&self, settings: &BackupSettings) -> String {
        format!(
            "{} {} {}",
            cron_expression(settings),
            self.runner.render(),
            CRON_MARKER
        )
    }

    /// Replace any existing entry with one built from `settings`
    pub async fn install(&self, settings: &BackupSettings) -> Result<String> {
        let line = self.schedule_line(settings);
        let existing = self.store.read().await?;
        let output = self
            .store
            .write(replace_marker_lines(&existing, Some(&line)))
            .await?;
        info!(expression = %cron_expression(settings), "backup schedule installed");
        Ok(output)
    }

    /// Remove the entry, leaving unrelated lines untouched
    pub async fn remove(&self) -> Result<String> {
        let existing = self.store.read().await?;
        let output = self
            .store
            .write(replace_marker_lines(&existing, None))
            .await?;
        info!("backup schedule removed");
        Ok(output)
    }

    /// Marker-tagged lines currently installed
    pub async fn installed_lines(&self) -> String {
        match self.store.read().await {
            Ok(table) => table
                .lines()
                .filter(|line| line.contains(CRON_MARKER))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => {
                debug!(error = %e, "unable to read schedule store");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory table shared with the test body
    #[derive(Clone, Default)]
    struct MemoryStore {
        table: Arc<Mutex<String>>,
    }

    #[async_trait]
    impl ScheduleStore for MemoryStore {
        async fn read(&self) -> Result<String> {
            Ok(self.table.lock().unwrap().clone())
        }

        async fn write(&self, contents: String) -> Result<String> {
            *self.table.lock().unwrap() = contents;
            Ok(String::new())
        }
    }

    fn runner() -> RunnerCommand {
        RunnerCommand {
            app_root: PathBuf::from("/srv/my shop"),
            executable: PathBuf::from("/usr/local/bin/b2-backup-console"),
            config_path: None,
            log_path: PathBuf::from("/srv/my shop/logs/backup-manager.log"),
            env: Vec::new(),
        }
    }

    fn settings(time: &str, frequency: ScheduleFrequency, weekday: u8) -> BackupSettings {
        BackupSettings {
            schedule_time: time.to_string(),
            schedule_frequency: frequency,
            schedule_weekday: weekday,
            ..Default::default()
        }
    }

    #[test]
    fn test_cron_expression() {
        assert_eq!(
            cron_expression(&settings("13:05", ScheduleFrequency::Weekly, 3)),
            "5 13 * * 3"
        );
        assert_eq!(
            cron_expression(&settings("13:05", ScheduleFrequency::Daily, 3)),
            "5 13 * * *"
        );
        assert_eq!(
            cron_expression(&settings("00:00", ScheduleFrequency::Daily, 0)),
            "0 0 * * *"
        );
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("/srv/my shop"), "'/srv/my shop'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_schedule_line_quotes_paths() {
        let scheduler = Scheduler::new(Arc::new(MemoryStore::default()), runner());
        let line = scheduler.schedule_line(&settings("02:30", ScheduleFrequency::Daily, 0));

        assert_eq!(
            line,
            "30 2 * * * cd '/srv/my shop' && '/usr/local/bin/b2-backup-console' run-scheduled >> '/srv/my shop/logs/backup-manager.log' 2>&1 # b2-backup-console-runner"
        );
    }

    #[test]
    fn test_schedule_line_forwards_runner_env() {
        let mut runner = runner();
        runner.config_path = Some(PathBuf::from("/etc/console.toml"));
        runner.env = vec![(
            "BACKUP_SETTINGS_DATABASE_URL".to_string(),
            "sqlite:///opt/console/backup_console.sqlite".to_string(),
        )];
        let scheduler = Scheduler::new(Arc::new(MemoryStore::default()), runner);
        let line = scheduler.schedule_line(&settings("02:30", ScheduleFrequency::Daily, 0));

        assert!(line.contains(
            "&& BACKUP_SETTINGS_DATABASE_URL='sqlite:///opt/console/backup_console.sqlite' '/usr/local/bin/b2-backup-console' --config '/etc/console.toml' run-scheduled"
        ));
    }

    #[test]
    fn test_replace_marker_lines_keeps_unrelated_entries() {
        let existing = format!("MAILTO=ops\n0 * * * * /bin/true\n1 1 * * * old {}\n", CRON_MARKER);
        assert_eq!(
            replace_marker_lines(&existing, Some("new line")),
            "MAILTO=ops\n0 * * * * /bin/true\nnew line\n"
        );
        assert_eq!(
            replace_marker_lines(&existing, None),
            "MAILTO=ops\n0 * * * * /bin/true\n"
        );
        assert_eq!(replace_marker_lines("", None), "");
    }

    #[tokio::test]
    async fn test_install_twice_leaves_one_entry() {
        let store = MemoryStore::default();
        *store.table.lock().unwrap() = "15 3 * * * /usr/bin/certbot renew\n".to_string();
        let scheduler = Scheduler::new(Arc::new(store.clone()), runner());

        scheduler
            .install(&settings("01:00", ScheduleFrequency::Daily, 0))
            .await
            .unwrap();
        scheduler
            .install(&settings("13:05", ScheduleFrequency::Weekly, 3))
            .await
            .unwrap();

        let table = store.table.lock().unwrap().clone();
        let tagged: Vec<&str> = table.lines().filter(|l| l.contains(CRON_MARKER)).collect();
        assert_eq!(tagged.len(), 1);
        assert!(tagged[0].starts_with("5 13 * * 3 "));
        assert!(table.contains("certbot renew"));

        assert_eq!(scheduler.installed_lines().await, tagged[0]);
    }

    #[tokio::test]
    async fn test_remove_clears_entry() {
        let store = MemoryStore::default();
        let scheduler = Scheduler::new(Arc::new(store.clone()), runner());

        scheduler
            .install(&settings("01:00", ScheduleFrequency::Daily, 0))
            .await
            .unwrap();
        scheduler.remove().await.unwrap();

        assert_eq!(store.table.lock().unwrap().as_str(), "");
        assert_eq!(scheduler.installed_lines().await, "");
    }

    #[tokio::test]
    async fn test_write_failure_is_surfaced() {
        let mut store = MockScheduleStore::new();
        store.expect_read().returning(|| Ok(String::new()));
        store.expect_write().returning(|_| {
            Err(BackupError::ScheduleOperationFailure(
                "crontab: permission denied".to_string(),
            ))
        });
        let scheduler = Scheduler::new(Arc::new(store), runner());

        let err = scheduler.remove().await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }
}
