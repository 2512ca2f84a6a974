//! Remote synchronization of backup files.
//!
//! Sync runs in detached tasks after a backup lands locally. It never fails
//! the operation that spawned it: every outcome ends in an audit log entry
//! (or silence when remote storage is disabled), and the catalog storage
//! location moves `local` to `both` only on success.

pub mod s3;

use serde_json::json;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::catalog::{log_event, Actor, BackupStatus, Catalog, LogAction, StorageLocation};
use crate::config::RemoteStorageSettings;
use crate::errors::{AppError, Result};

use async_trait::async_trait;

pub use s3::S3RemoteStorage;

const SYNC_MAX_ATTEMPTS: u32 = 3;
const SYNC_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Boundary to the remote object store. Settings are passed per call so
/// configuration changes take effect without restarting.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn put_object(
        &self,
        settings: &RemoteStorageSettings,
        key: &str,
        file_path: &Path,
    ) -> Result<()>;

    async fn delete_object(&self, settings: &RemoteStorageSettings, key: &str) -> Result<()>;

    async fn head_bucket(&self, settings: &RemoteStorageSettings) -> Result<()>;
}

/// Uploads one backup to remote storage with retries. Infallible by
/// contract: failures are recorded in the audit trail, not raised.
pub async fn sync_backup_to_remote(
    catalog: &dyn Catalog,
    remote: &dyn RemoteStorage,
    settings: &RemoteStorageSettings,
    backup_id: Uuid,
) {
    if !settings.enabled {
        return;
    }

    if !settings.is_complete() {
        log_event(
            catalog,
            Some(backup_id),
            LogAction::BackupSyncFailed,
            &Actor::system(),
            json!({ "reason": "remote storage is enabled but not fully configured" }),
        )
        .await;
        return;
    }

    let backup = match catalog.find_backup(backup_id).await {
        Ok(Some(b)) => b,
        Ok(None) => {
            eprintln!("⚠️ Sync skipped: backup {} not found", backup_id);
            return;
        }
        Err(e) => {
            eprintln!("⚠️ Sync skipped: failed to load backup {}: {}", backup_id, e);
            return;
        }
    };
    if backup.status != BackupStatus::Ready {
        return;
    }

    let key = settings.object_key(&backup.filename);
    let mut last_error: Option<AppError> = None;
    for attempt in 1..=SYNC_MAX_ATTEMPTS {
        match remote
            .put_object(settings, &key, Path::new(&backup.path))
            .await
        {
            Ok(()) => {
                println!(
                    "✅ Synced backup {} to remote storage as {}",
                    backup.filename, key
                );
                mark_synced(catalog, backup_id).await;
                log_event(
                    catalog,
                    Some(backup_id),
                    LogAction::BackupSynced,
                    &Actor::system(),
                    json!({ "bucket": settings.bucket, "key": key, "attempt": attempt }),
                )
                .await;
                return;
            }
            Err(e) => {
                eprintln!(
                    "⚠️ Sync attempt {}/{} for backup {} failed: {}",
                    attempt, SYNC_MAX_ATTEMPTS, backup.filename, e
                );
                last_error = Some(e);
                if attempt < SYNC_MAX_ATTEMPTS {
                    tokio::time::sleep(SYNC_BACKOFF_STEP * attempt).await;
                }
            }
        }
    }

    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    log_event(
        catalog,
        Some(backup_id),
        LogAction::BackupSyncFailed,
        &Actor::system(),
        json!({ "key": key, "attempts": SYNC_MAX_ATTEMPTS, "reason": reason }),
    )
    .await;
}

/// Moves the storage location forward; `both` never regresses to `local`.
async fn mark_synced(catalog: &dyn Catalog, backup_id: Uuid) {
    let backup = match catalog.find_backup(backup_id).await {
        Ok(Some(b)) => b,
        _ => return,
    };
    if backup.storage != StorageLocation::Local {
        return;
    }
    let mut updated = backup;
    updated.storage = StorageLocation::Both;
    if let Err(e) = catalog.save_backup(&updated).await {
        eprintln!(
            "⚠️ Failed to record remote copy of backup {}: {}",
            backup_id, e
        );
    }
}

/// Best-effort removal of the remote copy; never fails the caller.
pub async fn delete_remote_copy(
    remote: &dyn RemoteStorage,
    settings: &RemoteStorageSettings,
    filename: &str,
) {
    if !settings.enabled || !settings.is_complete() {
        return;
    }
    let key = settings.object_key(filename);
    if let Err(e) = remote.delete_object(settings, &key).await {
        eprintln!("⚠️ Failed to delete remote object {}: {}", key, e);
    }
}

/// Validates remote settings by probing the bucket.
pub async fn test_remote_settings(
    remote: &dyn RemoteStorage,
    settings: &RemoteStorageSettings,
) -> Result<()> {
    if !settings.is_complete() {
        return Err(AppError::MissingConfig(
            "bucket, region and credentials must all be set".to_string(),
        ));
    }
    remote.head_bucket(settings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{memory::MemoryCatalog, BackupType, NewBackup};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Remote fake that fails the first `fail_first` puts, then succeeds.
    #[derive(Default)]
    struct FakeRemote {
        fail_first: u32,
        puts: AtomicU32,
        keys: Mutex<Vec<String>>,
    }

    impl FakeRemote {
        fn failing(fail_first: u32) -> Self {
            Self {
                fail_first,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RemoteStorage for FakeRemote {
        async fn put_object(
            &self,
            _settings: &RemoteStorageSettings,
            key: &str,
            _file_path: &Path,
        ) -> Result<()> {
            let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(AppError::S3Sdk("connection reset".to_string()));
            }
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }

        async fn delete_object(
            &self,
            _settings: &RemoteStorageSettings,
            _key: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn head_bucket(&self, _settings: &RemoteStorageSettings) -> Result<()> {
            Ok(())
        }
    }

    fn remote_settings() -> RemoteStorageSettings {
        RemoteStorageSettings {
            enabled: true,
            bucket: Some("vault".to_string()),
            region: Some("us-east-1".to_string()),
            access_key_id: Some("ak".to_string()),
            secret_access_key: Some("sk".to_string()),
            prefix: Some("backups".to_string()),
            ..Default::default()
        }
    }

    async fn seeded_backup(catalog: &MemoryCatalog) -> crate::catalog::Backup {
        catalog
            .insert_backup(NewBackup {
                filename: "db_backup_x.sql".to_string(),
                path: "/backups/db_backup_x.sql".to_string(),
                kind: BackupType::Manual,
                storage: StorageLocation::Local,
                size_bytes: 10,
                sha256: "abc".to_string(),
                status: BackupStatus::Ready,
                encryption_meta: None,
                error_message: None,
                created_by: Actor::system(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_disabled_remote_is_a_silent_noop() {
        let catalog = MemoryCatalog::new();
        let backup = seeded_backup(&catalog).await;
        let settings = RemoteStorageSettings::default();

        sync_backup_to_remote(&catalog, &FakeRemote::default(), &settings, backup.id).await;
        assert!(catalog.logs().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_settings_log_sync_failed() {
        let catalog = MemoryCatalog::new();
        let backup = seeded_backup(&catalog).await;
        let settings = RemoteStorageSettings {
            enabled: true,
            ..Default::default()
        };

        sync_backup_to_remote(&catalog, &FakeRemote::default(), &settings, backup.id).await;
        let logs = catalog.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, LogAction::BackupSyncFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_retries_then_marks_both() -> anyhow::Result<()> {
        let catalog = MemoryCatalog::new();
        let backup = seeded_backup(&catalog).await;
        let remote = FakeRemote::failing(2);

        sync_backup_to_remote(&catalog, &remote, &remote_settings(), backup.id).await;

        let stored = catalog.find_backup(backup.id).await?.unwrap();
        assert_eq!(stored.storage, StorageLocation::Both);
        assert_eq!(
            remote.keys.lock().unwrap().clone(),
            vec!["backups/db_backup_x.sql".to_string()]
        );
        let logs = catalog.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, LogAction::BackupSynced);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_local_and_log_failure() -> anyhow::Result<()> {
        let catalog = MemoryCatalog::new();
        let backup = seeded_backup(&catalog).await;
        let remote = FakeRemote::failing(u32::MAX);

        sync_backup_to_remote(&catalog, &remote, &remote_settings(), backup.id).await;

        let stored = catalog.find_backup(backup.id).await?.unwrap();
        assert_eq!(stored.storage, StorageLocation::Local);
        let logs = catalog.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, LogAction::BackupSyncFailed);
        assert_eq!(remote.puts.load(Ordering::SeqCst), SYNC_MAX_ATTEMPTS);
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_settings_probe_requires_credentials() {
        let incomplete = RemoteStorageSettings {
            enabled: true,
            bucket: Some("vault".to_string()),
            ..Default::default()
        };
        let err = test_remote_settings(&FakeRemote::default(), &incomplete)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MissingConfig(_)));

        assert!(test_remote_settings(&FakeRemote::default(), &remote_settings())
            .await
            .is_ok());
    }
}
