//! Process configuration and the mutable settings aggregate.
//!
//! Static daemon configuration comes from a `config.json` next to the
//! executable. The retention/schedule/remote aggregate is mutable through
//! the admin API and lives behind [`SettingsStore`]; writes are
//! last-writer-wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::{AppError, Result};

pub const KEEP_LAST_DEFAULT: u32 = 100;
pub const KEEP_LAST_MIN: u32 = 1;
pub const KEEP_LAST_MAX: u32 = 1_000_000;

/// Static daemon configuration, deserialized from config.json.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Connection URL of the catalog database (backups table, settings).
    pub catalog_database_url: String,
    /// Connection URL of the database being backed up and restored.
    pub source_database_url: String,
    /// Directory holding backup files.
    pub backup_dir: PathBuf,
    #[serde(default = "default_retention_tick_secs")]
    pub retention_tick_secs: u64,
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
}

fn default_retention_tick_secs() -> u64 {
    60
}

fn default_scheduler_tick_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            AppError::Config(format!(
                "failed to read config file at {}: {}",
                config_path.display(),
                e
            ))
        })?;
        let config: AppConfig = serde_json::from_str(&config_content).map_err(|e| {
            AppError::Config(format!(
                "failed to parse JSON from config file at {}: {}",
                config_path.display(),
                e
            ))
        })?;
        if config.backup_dir.to_string_lossy().is_empty() {
            return Err(AppError::Config(
                "backup_dir cannot be empty in config.json".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Time-based retention period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPeriod {
    #[serde(rename = "1_minute")]
    OneMinute,
    Weekly,
    Monthly,
    #[serde(rename = "2_months")]
    TwoMonths,
    #[serde(rename = "3_months")]
    ThreeMonths,
    #[serde(rename = "6_months")]
    SixMonths,
    Yearly,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSettings {
    #[serde(default)]
    pub time_enabled: bool,
    #[serde(default = "default_period")]
    pub period: RetentionPeriod,
    #[serde(default)]
    pub count_enabled: bool,
    #[serde(default = "default_keep_last")]
    pub keep_last: u32,
}

fn default_period() -> RetentionPeriod {
    RetentionPeriod::Never
}

fn default_keep_last() -> u32 {
    KEEP_LAST_DEFAULT
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            time_enabled: false,
            period: RetentionPeriod::Never,
            count_enabled: false,
            keep_last: KEEP_LAST_DEFAULT,
        }
    }
}

impl RetentionSettings {
    /// Out-of-range `keep_last` values are silently clamped, not rejected.
    pub fn normalized(mut self) -> Self {
        if self.keep_last < KEEP_LAST_MIN || self.keep_last > KEEP_LAST_MAX {
            self.keep_last = KEEP_LAST_DEFAULT;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// One or more `HH:MM` times of day.
    #[serde(default)]
    pub times: Vec<String>,
    /// Legacy single-time format, kept for backward compatibility. Only
    /// consulted when `times` is empty; deduplicated by calendar day.
    #[serde(default)]
    pub time: Option<String>,
    /// De-duplication key of the last run (`date|time`, or just the date for
    /// legacy schedules).
    #[serde(default)]
    pub last_run_key: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// When set, scheduled backups are encrypted with this password.
    #[serde(default)]
    pub encryption_password: Option<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: default_timezone(),
            times: Vec::new(),
            time: None,
            last_run_key: None,
            last_run_at: None,
            encryption_password: None,
        }
    }
}

impl ScheduleSettings {
    /// The effective time slots: the multi-time list, or the legacy single
    /// time when no list is configured.
    pub fn slots(&self) -> Vec<String> {
        if !self.times.is_empty() {
            self.times.clone()
        } else {
            self.time.iter().cloned().collect()
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.times.is_empty() && self.time.is_some()
    }
}

/// Validates a `HH:MM` time-of-day string.
pub fn validate_time_of_day(value: &str) -> Result<()> {
    let parts: Vec<&str> = value.split(':').collect();
    let valid = parts.len() == 2
        && parts[0].len() == 2
        && parts[1].len() == 2
        && matches!(parts[0].parse::<u8>(), Ok(h) if h < 24)
        && matches!(parts[1].parse::<u8>(), Ok(m) if m < 60);
    if !valid {
        return Err(AppError::InvalidInput(format!(
            "invalid schedule time '{}': expected HH:MM",
            value
        )));
    }
    Ok(())
}

/// Validates a schedule update: well-formed unique times, known timezone.
pub fn validate_schedule(schedule: &ScheduleSettings) -> Result<()> {
    schedule.timezone.parse::<Tz>().map_err(|_| {
        AppError::InvalidInput(format!("unknown IANA timezone '{}'", schedule.timezone))
    })?;

    let mut seen = HashSet::new();
    for time in schedule.slots() {
        validate_time_of_day(&time)?;
        if !seen.insert(time.clone()) {
            return Err(AppError::InvalidInput(format!(
                "duplicate schedule time '{}'",
                time
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStorageSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Custom endpoint for S3-compatible providers; AWS when absent.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Path-style addressing, needed by some non-AWS endpoints.
    #[serde(default)]
    pub path_style: bool,
}

impl RemoteStorageSettings {
    /// Whether every credential field required for an upload is present.
    pub fn is_complete(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.is_empty());
        filled(&self.bucket)
            && filled(&self.region)
            && filled(&self.access_key_id)
            && filled(&self.secret_access_key)
    }

    /// Object key for a backup file: `prefix/filename` with the prefix
    /// stripped of surrounding slashes.
    pub fn object_key(&self, filename: &str) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, filename),
            _ => filename.to_string(),
        }
    }
}

/// The full mutable configuration aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub remote: RemoteStorageSettings,
}

/// Boundary to the configuration store.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self) -> Result<AppSettings>;
    async fn put(&self, settings: AppSettings) -> Result<()>;
}

/// In-memory settings store for tests and development.
#[derive(Default)]
pub struct MemorySettingsStore {
    inner: Mutex<AppSettings>,
}

impl MemorySettingsStore {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            inner: Mutex::new(settings),
        }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self) -> Result<AppSettings> {
        Ok(self.inner.lock().unwrap().clone())
    }

    async fn put(&self, settings: AppSettings) -> Result<()> {
        *self.inner.lock().unwrap() = settings;
        Ok(())
    }
}

/// Settings persisted as a single JSONB row in the catalog database.
pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS app_settings (id INT PRIMARY KEY, data JSONB NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn get(&self) -> Result<AppSettings> {
        let row: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT data FROM app_settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(data) => Ok(serde_json::from_value(data)?),
            None => Ok(AppSettings::default()),
        }
    }

    async fn put(&self, settings: AppSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_settings (id, data) VALUES (1, $1) \
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(serde_json::to_value(&settings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
