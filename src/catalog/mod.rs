//! Backup catalog: durable records for backups and their audit trail.
//!
//! The [`Catalog`] trait is the boundary to the relational store. The
//! production implementation is [`pg::PgCatalog`]; [`memory::MemoryCatalog`]
//! backs tests and single-process development runs. The trait also carries
//! the advisory-lock primitive the periodic engines use for cross-instance
//! mutual exclusion.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptionMeta;
use crate::errors::{AppError, Result};

/// Default page cap for listings.
pub const DEFAULT_PAGE_SIZE: i64 = 500;

/// Identity of whoever initiated an operation. Both fields are `None` for
/// system-initiated actions (scheduler, retention).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
}

impl Actor {
    pub fn system() -> Self {
        Self::default()
    }

    pub fn user(user_id: Uuid, email: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            email: Some(email.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Manual,
    Scheduled,
    Uploaded,
    PreRestore,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Manual => "manual",
            BackupType::Scheduled => "scheduled",
            BackupType::Uploaded => "uploaded",
            BackupType::PreRestore => "pre_restore",
        }
    }
}

impl std::str::FromStr for BackupType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(BackupType::Manual),
            "scheduled" => Ok(BackupType::Scheduled),
            "uploaded" => Ok(BackupType::Uploaded),
            "pre_restore" => Ok(BackupType::PreRestore),
            other => Err(AppError::Integrity(format!("unknown backup type: {}", other))),
        }
    }
}

/// Where the backup file currently lives. Transitions `local` to `both` once
/// remote sync succeeds and never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLocation {
    Local,
    Remote,
    Both,
}

impl StorageLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageLocation::Local => "local",
            StorageLocation::Remote => "remote",
            StorageLocation::Both => "both",
        }
    }
}

impl std::str::FromStr for StorageLocation {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(StorageLocation::Local),
            "remote" => Ok(StorageLocation::Remote),
            "both" => Ok(StorageLocation::Both),
            other => Err(AppError::Integrity(format!(
                "unknown storage location: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Ready,
    Failed,
    Deleted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Ready => "ready",
            BackupStatus::Failed => "failed",
            BackupStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for BackupStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(BackupStatus::Ready),
            "failed" => Ok(BackupStatus::Failed),
            "deleted" => Ok(BackupStatus::Deleted),
            other => Err(AppError::Integrity(format!("unknown status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedReason {
    Manual,
    Retention,
}

impl DeletedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletedReason::Manual => "manual",
            DeletedReason::Retention => "retention",
        }
    }
}

impl std::str::FromStr for DeletedReason {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(DeletedReason::Manual),
            "retention" => Ok(DeletedReason::Retention),
            other => Err(AppError::Integrity(format!(
                "unknown deletion reason: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    BackupCreated,
    BackupSynced,
    BackupSyncFailed,
    RestoreStarted,
    RestoreCompleted,
    RestoreFailed,
    BackupDeleted,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::BackupCreated => "backup_created",
            LogAction::BackupSynced => "backup_synced",
            LogAction::BackupSyncFailed => "backup_sync_failed",
            LogAction::RestoreStarted => "restore_started",
            LogAction::RestoreCompleted => "restore_completed",
            LogAction::RestoreFailed => "restore_failed",
            LogAction::BackupDeleted => "backup_deleted",
        }
    }
}

impl std::str::FromStr for LogAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backup_created" => Ok(LogAction::BackupCreated),
            "backup_synced" => Ok(LogAction::BackupSynced),
            "backup_sync_failed" => Ok(LogAction::BackupSyncFailed),
            "restore_started" => Ok(LogAction::RestoreStarted),
            "restore_completed" => Ok(LogAction::RestoreCompleted),
            "restore_failed" => Ok(LogAction::RestoreFailed),
            "backup_deleted" => Ok(LogAction::BackupDeleted),
            other => Err(AppError::Integrity(format!("unknown log action: {}", other))),
        }
    }
}

/// One durable backup record. Deleted backups stay in the catalog as
/// tombstones and are excluded from normal listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub filename: String,
    pub path: String,
    pub kind: BackupType,
    pub storage: StorageLocation,
    pub size_bytes: i64,
    pub sha256: String,
    pub status: BackupStatus,
    pub encryption_meta: Option<EncryptionMeta>,
    pub error_message: Option<String>,
    pub created_by_user_id: Option<Uuid>,
    pub created_by_email: Option<String>,
    pub deleted_by_user_id: Option<Uuid>,
    pub deleted_by_email: Option<String>,
    pub deleted_reason: Option<DeletedReason>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Backup {
    pub fn is_encrypted(&self) -> bool {
        self.encryption_meta.is_some()
    }
}

/// Fields of a new backup row; ids and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewBackup {
    pub filename: String,
    pub path: String,
    pub kind: BackupType,
    pub storage: StorageLocation,
    pub size_bytes: i64,
    pub sha256: String,
    pub status: BackupStatus,
    pub encryption_meta: Option<EncryptionMeta>,
    pub error_message: Option<String>,
    pub created_by: Actor,
}

/// One append-only audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupLog {
    pub id: Uuid,
    pub backup_id: Option<Uuid>,
    pub action: LogAction,
    pub actor_user_id: Option<Uuid>,
    pub actor_email: Option<String>,
    pub details: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub backup_id: Option<Uuid>,
    pub action: LogAction,
    pub actor: Actor,
    pub details: serde_json::Value,
}

/// Listing filter. Listings are always newest-first by creation time.
#[derive(Debug, Clone)]
pub struct BackupFilter {
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for BackupFilter {
    fn default() -> Self {
        Self {
            include_deleted: false,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

/// Boundary to the relational catalog store.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn insert_backup(&self, new: NewBackup) -> Result<Backup>;

    async fn find_backup(&self, id: Uuid) -> Result<Option<Backup>>;

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>>;

    async fn save_backup(&self, backup: &Backup) -> Result<()>;

    async fn count_backups(&self, include_deleted: bool) -> Result<i64>;

    async fn insert_log(&self, entry: NewLogEntry) -> Result<()>;

    /// Non-blocking acquisition of a cluster-wide advisory lock. `false`
    /// means another holder exists; the caller skips its tick.
    async fn try_advisory_lock(&self, key: i64) -> Result<bool>;

    async fn advisory_unlock(&self, key: i64) -> Result<()>;
}

/// Writes an audit log entry, swallowing any persistence failure so the
/// operation being logged is never affected.
pub async fn log_event(
    catalog: &dyn Catalog,
    backup_id: Option<Uuid>,
    action: LogAction,
    actor: &Actor,
    details: serde_json::Value,
) {
    let entry = NewLogEntry {
        backup_id,
        action,
        actor: actor.clone(),
        details,
    };
    if let Err(e) = catalog.insert_log(entry).await {
        eprintln!("⚠️ Failed to write {} audit log entry: {}", action.as_str(), e);
    }
}
