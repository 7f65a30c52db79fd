use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::str::FromStr;

use crate::backup::components::{file_component_keys, normalize_file_components};
use crate::backup::{BackupError, Result, DEFAULT_REGION};

// Settings store connection pool type
pub type DbPool = Pool<Sqlite>;

/// The settings table only ever holds this row
const SETTINGS_ROW_ID: i64 = 1;

/// Initialize the settings database, running migrations if necessary
pub async fn init_db(db_url: &str) -> Result<DbPool> {
    // Create database if it doesn't exist
    if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
        Sqlite::create_database(db_url).await?;
    }

    let options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// How often the scheduled backup runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleFrequency {
    #[default]
    Daily,
    Weekly,
}

impl ScheduleFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleFrequency::Daily => "daily",
            ScheduleFrequency::Weekly => "weekly",
        }
    }
}

impl FromStr for ScheduleFrequency {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "daily" => Ok(ScheduleFrequency::Daily),
            "weekly" => Ok(ScheduleFrequency::Weekly),
            other => Err(BackupError::Validation(format!(
                "schedule_frequency: The provided value `{}` must be daily or weekly",
                other
            ))),
        }
    }
}

/// Remote backup destination and schedule settings
#[derive(Clone, Serialize)]
pub struct BackupSettings {
    /// `None` until the record has been saved once
    pub id: Option<i64>,
    pub b2_key_id: String,
    #[serde(skip_serializing)]
    pub b2_application_key: String,
    /// `bucket[/prefix]`
    pub backup_path: String,
    pub b2_region: String,
    /// Comma separated file components
    pub backup_components: String,
    pub schedule_enabled: bool,
    pub schedule_frequency: ScheduleFrequency,
    /// `HH:MM`
    pub schedule_time: String,
    /// 0 = Sunday
    pub schedule_weekday: u8,
    pub retention_days: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            id: None,
            b2_key_id: String::new(),
            b2_application_key: String::new(),
            backup_path: String::new(),
            b2_region: DEFAULT_REGION.to_string(),
            backup_components: file_component_keys().join(","),
            schedule_enabled: true,
            schedule_frequency: ScheduleFrequency::Daily,
            schedule_time: String::from("00:00"),
            schedule_weekday: 0,
            retention_days: 45,
            created_at: None,
            updated_at: None,
        }
    }
}

impl std::fmt::Debug for BackupSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupSettings")
            .field("id", &self.id)
            .field("b2_key_id", &self.b2_key_id)
            .field("b2_application_key", &"<redacted>")
            .field("backup_path", &self.backup_path)
            .field("b2_region", &self.b2_region)
            .field("backup_components", &self.backup_components)
            .field("schedule_enabled", &self.schedule_enabled)
            .field("schedule_frequency", &self.schedule_frequency)
            .field("schedule_time", &self.schedule_time)
            .field("schedule_weekday", &self.schedule_weekday)
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

fn check_max_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(BackupError::Validation(format!(
            "{}: The provided value must be no more than {} characters",
            field, max
        )));
    }
    Ok(())
}

fn is_valid_time(value: &str) -> bool {
    value.len() == 5 && NaiveTime::parse_from_str(value, "%H:%M").is_ok()
}

impl BackupSettings {
    /// Key id, application key and backup path are all present
    pub fn has_required_settings(&self) -> bool {
        !self.b2_key_id.trim().is_empty()
            && !self.b2_application_key.trim().is_empty()
            && !self.backup_path.trim().is_empty()
    }

    /// Check field constraints, reporting the first violation
    pub fn validate(&self) -> Result<()> {
        check_max_len("b2_key_id", &self.b2_key_id, 255)?;
        check_max_len("b2_application_key", &self.b2_application_key, 255)?;
        check_max_len("backup_path", &self.backup_path, 255)?;
        check_max_len("b2_region", &self.b2_region, 64)?;
        check_max_len("backup_components", &self.backup_components, 1000)?;

        if !is_valid_time(&self.schedule_time) {
            return Err(BackupError::Validation(
                "schedule_time: Time must be HH:MM".to_string(),
            ));
        }
        if self.schedule_weekday > 6 {
            return Err(BackupError::Validation(
                "schedule_weekday: The provided value must be between 0 and 6".to_string(),
            ));
        }
        if !(1..=3650).contains(&self.retention_days) {
            return Err(BackupError::Validation(
                "retention_days: The provided value must be between 1 and 3650".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a submitted form on top of these settings
    ///
    /// Stored credentials are kept when the form leaves them blank so secrets
    /// never need to be echoed back into the form.
    pub fn patched(&self, form: SettingsForm) -> Result<BackupSettings> {
        let mut next = self.clone();
        let saved = self.id.is_some();

        match form.b2_key_id {
            Some(v) if !v.trim().is_empty() => next.b2_key_id = v.trim().to_string(),
            _ if saved => {}
            _ => next.b2_key_id = String::new(),
        }
        match form.b2_application_key {
            Some(v) if !v.trim().is_empty() => next.b2_application_key = v.trim().to_string(),
            _ if saved => {}
            _ => next.b2_application_key = String::new(),
        }
        if let Some(path) = form.backup_path {
            next.backup_path = path.trim().to_string();
        }
        if let Some(region) = form.b2_region {
            next.b2_region = region.trim().to_string();
        }
        next.backup_components = normalize_file_components(&form.backup_components).join(",");
        next.schedule_enabled = form.schedule_enabled.unwrap_or(false);
        if let Some(frequency) = form.schedule_frequency {
            next.schedule_frequency = frequency.parse()?;
        }
        if let Some(time) = form.schedule_time.filter(|t| !t.is_empty()) {
            next.schedule_time = time.chars().take(5).collect();
        }
        if let Some(weekday) = form.schedule_weekday {
            next.schedule_weekday = weekday;
        }
        if let Some(days) = form.retention_days {
            next.retention_days = days;
        }

        next.validate()?;
        Ok(next)
    }
}

/// Settings as submitted from the control surface
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettingsForm {
    pub b2_key_id: Option<String>,
    pub b2_application_key: Option<String>,
    pub backup_path: Option<String>,
    pub b2_region: Option<String>,
    pub backup_components: Vec<String>,
    pub schedule_enabled: Option<bool>,
    pub schedule_frequency: Option<String>,
    pub schedule_time: Option<String>,
    pub schedule_weekday: Option<u8>,
    pub retention_days: Option<u32>,
}

/// Access to the singleton settings record
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// The stored record, if one was ever saved
    async fn get(&self) -> Result<Option<BackupSettings>>;

    /// Persist the record and return it as stored
    async fn save(&self, settings: &BackupSettings) -> Result<BackupSettings>;
}

/// Settings repository backed by the SQLite settings store
pub struct SqliteSettingsRepository {
    pool: DbPool,
}

impl SqliteSettingsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn settings_from_row(row: &SqliteRow) -> std::result::Result<BackupSettings, sqlx::Error> {
    let frequency: String = row.try_get("schedule_frequency")?;
    let weekday: i64 = row.try_get("schedule_weekday")?;
    let retention: i64 = row.try_get("retention_days")?;

    Ok(BackupSettings {
        id: Some(row.try_get("id")?),
        b2_key_id: row.try_get::<Option<String>, _>("b2_key_id")?.unwrap_or_default(),
        b2_application_key: row
            .try_get::<Option<String>, _>("b2_application_key")?
            .unwrap_or_default(),
        backup_path: row.try_get::<Option<String>, _>("backup_path")?.unwrap_or_default(),
        b2_region: row.try_get("b2_region")?,
        backup_components: row
            .try_get::<Option<String>, _>("backup_components")?
            .unwrap_or_default(),
        schedule_enabled: row.try_get("schedule_enabled")?,
        schedule_frequency: frequency.parse().unwrap_or_default(),
        schedule_time: row.try_get("schedule_time")?,
        schedule_weekday: weekday.clamp(0, 6) as u8,
        retention_days: retention.clamp(1, 3650) as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl SettingsRepository for SqliteSettingsRepository {
    async fn get(&self) -> Result<Option<BackupSettings>> {
        let row = sqlx::query(
            r#"
            SELECT id, b2_key_id, b2_application_key, backup_path, b2_region,
                   backup_components, schedule_enabled, schedule_frequency,
                   schedule_time, schedule_weekday, retention_days,
                   created_at, updated_at
            FROM backup_settings
            ORDER BY id
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(settings_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, settings: &BackupSettings) -> Result<BackupSettings> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO backup_settings (
                id, b2_key_id, b2_application_key, backup_path, b2_region,
                backup_components, schedule_enabled, schedule_frequency,
                schedule_time, schedule_weekday, retention_days,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                b2_key_id = excluded.b2_key_id,
                b2_application_key = excluded.b2_application_key,
                backup_path = excluded.backup_path,
                b2_region = excluded.b2_region,
                backup_components = excluded.backup_components,
                schedule_enabled = excluded.schedule_enabled,
                schedule_frequency = excluded.schedule_frequency,
                schedule_time = excluded.schedule_time,
                schedule_weekday = excluded.schedule_weekday,
                retention_days = excluded.retention_days,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(settings.id.unwrap_or(SETTINGS_ROW_ID))
        .bind(&settings.b2_key_id)
        .bind(&settings.b2_application_key)
        .bind(&settings.backup_path)
        .bind(&settings.b2_region)
        .bind(&settings.backup_components)
        .bind(settings.schedule_enabled)
        .bind(settings.schedule_frequency.as_str())
        .bind(&settings.schedule_time)
        .bind(settings.schedule_weekday as i64)
        .bind(settings.retention_days as i64)
        .bind(settings.created_at.unwrap_or(now))
        .bind(now)
        .execute(&self.pool)
        .await?;

        match self.get().await? {
            Some(stored) => Ok(stored),
            None => Err(BackupError::Settings(sqlx::Error::RowNotFound.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> DbPool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}
