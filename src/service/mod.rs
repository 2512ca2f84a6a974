//! Backup lifecycle service: the operations the HTTP layer calls.
//!
//! Pipelines (create/restore) run as detached tasks and report progress
//! through the [`JobTracker`]; everything else here is a direct async
//! operation. The service owns no state of its own beyond its collaborators,
//! so it is cheap to clone into spawned tasks.

mod create;
mod restore;

use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::catalog::{
    log_event, Actor, Backup, BackupFilter, BackupStatus, BackupType, Catalog, DeletedReason,
    LogAction, NewBackup, StorageLocation, DEFAULT_PAGE_SIZE,
};
use crate::config::{
    validate_schedule, AppSettings, RemoteStorageSettings, RetentionSettings, ScheduleSettings,
    SettingsStore,
};
use crate::crypto;
use crate::engine::DatabaseEngine;
use crate::errors::{AppError, Result};
use crate::jobs::{Job, JobTracker};
use crate::sync::{self, RemoteStorage};

pub use create::backup_filename;

/// Uploaded dump files are capped at 10 GiB.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Content types accepted for uploaded dump files.
const UPLOAD_CONTENT_TYPES: [&str; 4] = [
    "application/sql",
    "application/x-sql",
    "text/sql",
    "text/plain",
];

#[derive(Clone)]
pub struct BackupService {
    catalog: Arc<dyn Catalog>,
    settings: Arc<dyn SettingsStore>,
    remote: Arc<dyn RemoteStorage>,
    engine: Arc<dyn DatabaseEngine>,
    jobs: JobTracker,
    backup_dir: PathBuf,
}

impl BackupService {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        settings: Arc<dyn SettingsStore>,
        remote: Arc<dyn RemoteStorage>,
        engine: Arc<dyn DatabaseEngine>,
        backup_dir: PathBuf,
    ) -> Self {
        Self {
            catalog,
            settings,
            remote,
            engine,
            jobs: JobTracker::new(),
            backup_dir,
        }
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub(crate) fn engine(&self) -> &dyn DatabaseEngine {
        self.engine.as_ref()
    }

    pub(crate) fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    pub(crate) fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Job status lookup; `None` for unknown or already-evicted ids.
    pub fn job(&self, id: &str) -> Option<Job> {
        self.jobs.get(id)
    }

    pub async fn list_backups(
        &self,
        include_deleted: bool,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<Backup>> {
        let filter = BackupFilter {
            include_deleted,
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, DEFAULT_PAGE_SIZE),
            offset: offset.max(0),
        };
        self.catalog.list_backups(&filter).await
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<Backup> {
        self.catalog
            .find_backup(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup {}", id)))
    }

    /// Returns a reader over the backup's plaintext, decrypting segment by
    /// segment when the backup is encrypted. A password is required exactly
    /// when the backup is encrypted; a wrong password surfaces as an
    /// `InvalidData` I/O error on the first read.
    pub async fn download_backup(
        &self,
        id: Uuid,
        password: Option<&str>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let backup = self.get_backup(id).await?;
        if backup.status != BackupStatus::Ready {
            return Err(AppError::NotFound(format!("backup {} is not ready", id)));
        }

        match &backup.encryption_meta {
            Some(meta) => {
                let password = password.filter(|p| !p.trim().is_empty()).ok_or_else(|| {
                    AppError::InvalidInput(
                        "a password is required to download this encrypted backup".to_string(),
                    )
                })?;
                let reader =
                    crypto::decrypt_file_to_stream(Path::new(&backup.path), password, meta).await?;
                Ok(Box::new(reader))
            }
            None => Ok(Box::new(tokio::fs::File::open(&backup.path).await?)),
        }
    }

    /// Registers a caller-provided dump file as an uploaded backup. The
    /// size, `.sql` extension, declared content type and body are all
    /// validated before anything touches disk.
    pub async fn upload_backup_file(
        &self,
        actor: Actor,
        original_filename: &str,
        content_type: &str,
        body: &[u8],
        encryption_password: Option<&str>,
    ) -> Result<Backup> {
        if body.is_empty() {
            return Err(AppError::InvalidInput("uploaded file is empty".to_string()));
        }
        if body.len() as u64 > MAX_UPLOAD_BYTES {
            return Err(AppError::InvalidInput(format!(
                "uploaded file exceeds the {} byte limit",
                MAX_UPLOAD_BYTES
            )));
        }
        if !original_filename.to_ascii_lowercase().ends_with(".sql") {
            return Err(AppError::InvalidInput(
                "only .sql dump files can be uploaded".to_string(),
            ));
        }
        validate_upload_content(content_type, body)?;

        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let filename = format!(
            "{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            sanitize_filename(original_filename)
        );
        let path = self.backup_dir.join(&filename);
        tokio::fs::write(&path, body).await?;

        let encryption_meta = match encryption_password {
            Some(password) => match crypto::encrypt_file_in_place(&path, password, None).await {
                Ok(meta) => Some(meta),
                Err(e) => {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let sha256 = crypto::sha256_file(&path).await?;
        let size_bytes = tokio::fs::metadata(&path).await?.len() as i64;

        let backup = self
            .catalog
            .insert_backup(NewBackup {
                filename: filename.clone(),
                path: path.display().to_string(),
                kind: BackupType::Uploaded,
                storage: StorageLocation::Local,
                size_bytes,
                sha256,
                status: BackupStatus::Ready,
                encryption_meta,
                error_message: None,
                created_by: actor.clone(),
            })
            .await?;

        log_event(
            self.catalog.as_ref(),
            Some(backup.id),
            LogAction::BackupCreated,
            &actor,
            json!({ "kind": "uploaded", "filename": filename, "size_bytes": size_bytes }),
        )
        .await;
        println!("✅ Registered uploaded backup {}", backup.filename);

        self.spawn_remote_sync(backup.id);
        Ok(backup)
    }

    /// Marks a backup deleted: best-effort remote delete, best-effort local
    /// file removal, then a catalog tombstone. Already-deleted backups are a
    /// no-op.
    pub async fn delete_backup(
        &self,
        id: Uuid,
        actor: Actor,
        reason: DeletedReason,
    ) -> Result<Backup> {
        let mut backup = self.get_backup(id).await?;
        if backup.status == BackupStatus::Deleted {
            return Ok(backup);
        }

        if backup.storage != StorageLocation::Local {
            let settings = self.settings.get().await?;
            sync::delete_remote_copy(self.remote.as_ref(), &settings.remote, &backup.filename)
                .await;
        }
        if backup.storage != StorageLocation::Remote {
            if let Err(e) = tokio::fs::remove_file(&backup.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    eprintln!("⚠️ Failed to remove backup file {}: {}", backup.path, e);
                }
            }
        }

        backup.status = BackupStatus::Deleted;
        backup.deleted_by_user_id = actor.user_id;
        backup.deleted_by_email = actor.email.clone();
        backup.deleted_reason = Some(reason);
        backup.deleted_at = Some(Utc::now());
        self.catalog.save_backup(&backup).await?;

        log_event(
            self.catalog.as_ref(),
            Some(id),
            LogAction::BackupDeleted,
            &actor,
            json!({ "reason": reason.as_str(), "filename": backup.filename }),
        )
        .await;
        println!(
            "🗑️ Deleted backup {} (reason: {})",
            backup.filename,
            reason.as_str()
        );
        Ok(backup)
    }

    pub async fn get_settings(&self) -> Result<AppSettings> {
        self.settings.get().await
    }

    pub(crate) async fn put_settings(&self, settings: AppSettings) -> Result<()> {
        self.settings.put(settings).await
    }

    pub async fn update_retention(&self, retention: RetentionSettings) -> Result<RetentionSettings> {
        let mut settings = self.settings.get().await?;
        settings.retention = retention.normalized();
        self.settings.put(settings.clone()).await?;
        Ok(settings.retention)
    }

    /// Replaces the schedule. The stored last-run bookkeeping survives the
    /// update so an edit does not re-trigger an already-run slot.
    pub async fn update_schedule(&self, schedule: ScheduleSettings) -> Result<ScheduleSettings> {
        validate_schedule(&schedule)?;
        let mut settings = self.settings.get().await?;
        let mut updated = schedule;
        updated.last_run_key = settings.schedule.last_run_key.clone();
        updated.last_run_at = settings.schedule.last_run_at;
        settings.schedule = updated;
        self.settings.put(settings.clone()).await?;
        Ok(settings.schedule)
    }

    pub async fn update_remote(
        &self,
        remote: RemoteStorageSettings,
    ) -> Result<RemoteStorageSettings> {
        let mut settings = self.settings.get().await?;
        settings.remote = remote;
        self.settings.put(settings.clone()).await?;
        Ok(settings.remote)
    }

    /// Probes the configured bucket with current (or candidate) settings.
    pub async fn test_remote(&self, candidate: Option<&RemoteStorageSettings>) -> Result<()> {
        match candidate {
            Some(remote) => sync::test_remote_settings(self.remote.as_ref(), remote).await,
            None => {
                let settings = self.settings.get().await?;
                sync::test_remote_settings(self.remote.as_ref(), &settings.remote).await
            }
        }
    }

    /// Starts a scheduled-style backup immediately, using the schedule's
    /// configured encryption password.
    pub async fn trigger_scheduled_backup(&self, actor: Actor) -> Result<Job> {
        let settings = self.settings.get().await?;
        Ok(self
            .start_create_backup_job(
                actor,
                BackupType::Scheduled,
                settings.schedule.encryption_password,
            )
            .await)
    }

    /// Detached remote sync for one backup; never affects the caller.
    pub(crate) fn spawn_remote_sync(&self, backup_id: Uuid) {
        let service = self.clone();
        tokio::spawn(async move {
            let settings = match service.settings.get().await {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("⚠️ Sync skipped: failed to load settings: {}", e);
                    return;
                }
            };
            sync::sync_backup_to_remote(
                service.catalog.as_ref(),
                service.remote.as_ref(),
                &settings.remote,
                backup_id,
            )
            .await;
        });
    }

    /// Detached single retention pass; errors are logged, never raised.
    pub(crate) fn spawn_retention_pass(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::retention::run_retention_pass(&service).await {
                eprintln!("⚠️ Retention pass failed: {}", e);
            }
        });
    }
}

/// Rejects uploads whose declared content type is not a SQL/text type, and
/// binary payloads smuggled under a text type.
fn validate_upload_content(content_type: &str, body: &[u8]) -> Result<()> {
    // Strip parameters such as "; charset=utf-8".
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if !UPLOAD_CONTENT_TYPES.contains(&media_type.as_str()) {
        return Err(AppError::InvalidInput(format!(
            "unsupported content type for a SQL dump: {}",
            content_type
        )));
    }
    let head = &body[..body.len().min(1024)];
    if head.contains(&0) {
        return Err(AppError::InvalidInput(
            "uploaded file is not a text SQL dump".to_string(),
        ));
    }
    Ok(())
}

/// Keeps `[A-Za-z0-9._-]`, replaces everything else with `_`.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
