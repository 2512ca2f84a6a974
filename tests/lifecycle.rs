//! End-to-end lifecycle tests against in-memory collaborators and a
//! scripted database engine.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use backupvault::catalog::{
    memory::MemoryCatalog, Actor, BackupStatus, BackupType, Catalog, LogAction, NewBackup,
    StorageLocation,
};
use backupvault::config::{
    MemorySettingsStore, RemoteStorageSettings, ScheduleSettings, SettingsStore,
};
use backupvault::engine::DatabaseEngine;
use backupvault::errors::{AppError, Result};
use backupvault::jobs::{Job, JobStage};
use backupvault::retention::run_retention_pass;
use backupvault::scheduler::run_scheduler_tick;
use backupvault::service::BackupService;
use backupvault::sync::RemoteStorage;

const DUMP_BODY: &[u8] = b"-- PostgreSQL database dump\nCREATE TABLE t (id int);\n";

/// Engine fake: dumps a fixed script, records restore invocations.
struct FakeEngine {
    fail_restore: AtomicBool,
    restores: Mutex<Vec<PathBuf>>,
}

impl FakeEngine {
    fn new() -> Self {
        Self {
            fail_restore: AtomicBool::new(false),
            restores: Mutex::new(Vec::new()),
        }
    }

    fn restore_count(&self) -> usize {
        self.restores.lock().unwrap().len()
    }
}

#[async_trait]
impl DatabaseEngine for FakeEngine {
    async fn dump_to_file(&self, dest: &Path) -> Result<()> {
        tokio::fs::write(dest, DUMP_BODY).await?;
        Ok(())
    }

    async fn restore_from_file(&self, script: &Path) -> Result<()> {
        let body = tokio::fs::read(script).await?;
        self.restores.lock().unwrap().push(script.to_path_buf());
        assert_eq!(body, DUMP_BODY, "restore must receive the plaintext dump");
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(AppError::Restore("psql exited with code 3".to_string()));
        }
        Ok(())
    }
}

/// Remote fake that always fails puts.
struct BrokenRemote;

#[async_trait]
impl RemoteStorage for BrokenRemote {
    async fn put_object(
        &self,
        _settings: &RemoteStorageSettings,
        _key: &str,
        _file_path: &Path,
    ) -> Result<()> {
        Err(AppError::S3Sdk("connection refused".to_string()))
    }

    async fn delete_object(&self, _settings: &RemoteStorageSettings, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn head_bucket(&self, _settings: &RemoteStorageSettings) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    service: BackupService,
    catalog: Arc<MemoryCatalog>,
    settings: Arc<MemorySettingsStore>,
    engine: Arc<FakeEngine>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    let settings = Arc::new(MemorySettingsStore::default());
    let engine = Arc::new(FakeEngine::new());
    let service = BackupService::new(
        catalog.clone(),
        settings.clone(),
        Arc::new(BrokenRemote),
        engine.clone(),
        dir.path().to_path_buf(),
    );
    Harness {
        service,
        catalog,
        settings,
        engine,
        _dir: dir,
    }
}

async fn wait_for_job(service: &BackupService, id: &str) -> Job {
    for _ in 0..500 {
        if let Some(job) = service.job(id) {
            if job.is_finished() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not finish in time", id);
}

async fn create_backup(h: &Harness, password: Option<&str>) -> backupvault::catalog::Backup {
    let job = h
        .service
        .start_create_backup_job(
            Actor::system(),
            BackupType::Manual,
            password.map(str::to_string),
        )
        .await;
    let done = wait_for_job(&h.service, &job.id).await;
    assert_eq!(done.stage, JobStage::Done);
    h.service
        .get_backup(done.backup_id.expect("done job carries a backup id"))
        .await
        .unwrap()
}

#[tokio::test]
async fn scenario_a_unencrypted_backup_and_raw_download() -> anyhow::Result<()> {
    let h = harness();
    let backup = create_backup(&h, None).await;

    assert_eq!(backup.status, BackupStatus::Ready);
    assert_eq!(backup.storage, StorageLocation::Local);
    assert!(backup.encryption_meta.is_none());
    assert_eq!(backup.size_bytes, DUMP_BODY.len() as i64);

    let on_disk = tokio::fs::read(&backup.path).await?;
    assert_eq!(on_disk, DUMP_BODY);

    let mut reader = h.service.download_backup(backup.id, None).await?;
    let mut downloaded = Vec::new();
    reader.read_to_end(&mut downloaded).await?;
    assert_eq!(downloaded, DUMP_BODY);

    let actions: Vec<LogAction> = h.catalog.logs().iter().map(|l| l.action).collect();
    assert!(actions.contains(&LogAction::BackupCreated));
    Ok(())
}

#[tokio::test]
async fn scenario_b_encrypted_backup_download_requires_password() -> anyhow::Result<()> {
    let h = harness();
    let backup = create_backup(&h, Some("pw1")).await;

    let meta = backup.encryption_meta.clone().expect("metadata populated");
    assert_eq!(meta.iterations, backupvault::crypto::DEFAULT_PBKDF2_ITERATIONS);

    // Ciphertext on disk, not the dump text.
    let on_disk = tokio::fs::read(&backup.path).await?;
    assert_ne!(on_disk, DUMP_BODY);

    let err = h
        .service
        .download_backup(backup.id, None)
        .await
        .err()
        .expect("download without password should fail");
    assert!(matches!(err, AppError::InvalidInput(_)));

    // A wrong password fails the first segment's tag check while streaming.
    let mut reader = h.service.download_backup(backup.id, Some("pw2")).await?;
    let mut buf = Vec::new();
    let err = reader.read_to_end(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    assert!(buf.is_empty());

    let mut reader = h.service.download_backup(backup.id, Some("pw1")).await?;
    let mut plaintext = Vec::new();
    reader.read_to_end(&mut plaintext).await?;
    assert_eq!(plaintext, DUMP_BODY);
    Ok(())
}

#[tokio::test]
async fn scenario_c_restore_takes_pre_restore_snapshot_even_on_failure() -> anyhow::Result<()> {
    let h = harness();
    let backup = create_backup(&h, None).await;
    h.engine.fail_restore.store(true, Ordering::SeqCst);

    let job = h
        .service
        .start_restore_backup_job(Actor::system(), backup.id, None)
        .await?;
    let done = wait_for_job(&h.service, &job.id).await;
    assert_eq!(done.stage, JobStage::Failed);
    assert_eq!(h.engine.restore_count(), 1);

    let snapshots: Vec<_> = h
        .service
        .list_backups(false, None, 0)
        .await?
        .into_iter()
        .filter(|b| b.kind == BackupType::PreRestore)
        .collect();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status, BackupStatus::Ready);

    let actions: Vec<LogAction> = h.catalog.logs().iter().map(|l| l.action).collect();
    assert!(actions.contains(&LogAction::RestoreStarted));
    assert!(actions.contains(&LogAction::RestoreFailed));
    Ok(())
}

#[tokio::test]
async fn scenario_d_sync_failures_never_fail_the_create_job() -> anyhow::Result<()> {
    let h = harness();
    let mut settings = h.settings.get().await?;
    settings.remote = RemoteStorageSettings {
        enabled: true,
        bucket: Some("vault".to_string()),
        region: Some("us-east-1".to_string()),
        access_key_id: Some("ak".to_string()),
        secret_access_key: Some("sk".to_string()),
        ..Default::default()
    };
    h.settings.put(settings).await?;

    let backup = create_backup(&h, None).await;

    // Sync runs detached with two backoff sleeps; wait for its verdict.
    for _ in 0..500 {
        if h.catalog
            .logs()
            .iter()
            .any(|l| l.action == LogAction::BackupSyncFailed)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let sync_failures = h
        .catalog
        .logs()
        .iter()
        .filter(|l| l.action == LogAction::BackupSyncFailed)
        .count();
    assert_eq!(sync_failures, 1);

    let stored = h.service.get_backup(backup.id).await?;
    assert_eq!(stored.storage, StorageLocation::Local);
    assert_eq!(stored.status, BackupStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn checksum_gate_blocks_restore_before_subprocess() -> anyhow::Result<()> {
    let h = harness();
    let backup = create_backup(&h, None).await;

    // Flip one byte after creation.
    let mut bytes = tokio::fs::read(&backup.path).await?;
    bytes[0] ^= 0x01;
    tokio::fs::write(&backup.path, &bytes).await?;

    let job = h
        .service
        .start_restore_backup_job(Actor::system(), backup.id, None)
        .await?;
    let done = wait_for_job(&h.service, &job.id).await;

    assert_eq!(done.stage, JobStage::Failed);
    assert!(done.error.unwrap().contains("digest does not match"));
    assert_eq!(h.engine.restore_count(), 0);

    // The gate also fires before the safety snapshot.
    let snapshots = h
        .service
        .list_backups(false, None, 0)
        .await?
        .into_iter()
        .filter(|b| b.kind == BackupType::PreRestore)
        .count();
    assert_eq!(snapshots, 0);
    Ok(())
}

#[tokio::test]
async fn encrypted_restore_decrypts_to_temp_and_cleans_up() -> anyhow::Result<()> {
    let h = harness();
    let backup = create_backup(&h, Some("pw1")).await;

    let err = h
        .service
        .start_restore_backup_job(Actor::system(), backup.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let job = h
        .service
        .start_restore_backup_job(Actor::system(), backup.id, Some("pw1".to_string()))
        .await?;
    let done = wait_for_job(&h.service, &job.id).await;
    assert_eq!(done.stage, JobStage::Done);
    assert_eq!(h.engine.restore_count(), 1);

    // No restore_tmp leftovers.
    let mut entries = tokio::fs::read_dir(h._dir.path()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        assert!(!name.starts_with("restore_tmp_"), "leftover temp: {}", name);
    }
    Ok(())
}

#[tokio::test]
async fn wrong_restore_password_fails_before_anything_destructive() -> anyhow::Result<()> {
    let h = harness();
    let backup = create_backup(&h, Some("pw1")).await;

    let job = h
        .service
        .start_restore_backup_job(Actor::system(), backup.id, Some("pw2".to_string()))
        .await?;
    let done = wait_for_job(&h.service, &job.id).await;

    assert_eq!(done.stage, JobStage::Failed);
    assert!(done.error.unwrap().contains("Invalid encryption password"));
    assert_eq!(h.engine.restore_count(), 0);
    Ok(())
}

fn seeded(name: &str) -> NewBackup {
    NewBackup {
        filename: name.to_string(),
        path: format!("/nonexistent/{}", name),
        kind: BackupType::Manual,
        storage: StorageLocation::Local,
        size_bytes: 1,
        sha256: "00".to_string(),
        status: BackupStatus::Ready,
        encryption_meta: None,
        error_message: None,
        created_by: Actor::system(),
    }
}

#[tokio::test]
async fn retention_protects_newest_n_and_is_idempotent() -> anyhow::Result<()> {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..5 {
        let backup = h.catalog.insert_backup(seeded(&format!("b{}.sql", i))).await?;
        // Oldest first: b0 is 5 days old, b4 one day old.
        h.catalog
            .backdate(backup.id, Utc::now() - ChronoDuration::days(5 - i));
        ids.push(backup.id);
    }

    let mut settings = h.settings.get().await?;
    settings.retention.count_enabled = true;
    settings.retention.keep_last = 3;
    h.settings.put(settings).await?;

    run_retention_pass(&h.service).await?;
    let remaining = h.service.list_backups(false, None, 0).await?;
    assert_eq!(remaining.len(), 3);
    let names: Vec<_> = remaining.iter().map(|b| b.filename.clone()).collect();
    assert_eq!(names, vec!["b4.sql", "b3.sql", "b2.sql"]);

    // Second pass with no new backups deletes nothing further.
    run_retention_pass(&h.service).await?;
    assert_eq!(h.service.list_backups(false, None, 0).await?.len(), 3);

    let retention_deletes = h
        .catalog
        .logs()
        .iter()
        .filter(|l| l.action == LogAction::BackupDeleted)
        .count();
    assert_eq!(retention_deletes, 2);
    Ok(())
}

#[tokio::test]
async fn retention_time_rule_spares_protected_newest() -> anyhow::Result<()> {
    let h = harness();
    for i in 0..4 {
        let backup = h.catalog.insert_backup(seeded(&format!("t{}.sql", i))).await?;
        h.catalog
            .backdate(backup.id, Utc::now() - ChronoDuration::days(30 + i));
    }

    let mut settings = h.settings.get().await?;
    settings.retention.time_enabled = true;
    settings.retention.period = backupvault::config::RetentionPeriod::Weekly;
    settings.retention.count_enabled = true;
    settings.retention.keep_last = 2;
    h.settings.put(settings).await?;

    run_retention_pass(&h.service).await?;
    // All four are past the weekly cutoff, but the newest two are protected.
    assert_eq!(h.service.list_backups(false, None, 0).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn scheduler_runs_each_slot_once_per_day() -> anyhow::Result<()> {
    let h = harness();
    let mut settings = h.settings.get().await?;
    settings.schedule = ScheduleSettings {
        enabled: true,
        timezone: "UTC".to_string(),
        times: vec!["03:00".to_string()],
        ..Default::default()
    };
    h.settings.put(settings).await?;

    let at_3 = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 10).unwrap();
    run_scheduler_tick(&h.service, at_3).await?;

    // Wait for the kicked job to land a scheduled backup.
    for _ in 0..500 {
        if h.service.list_backups(false, None, 0).await?.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let backups = h.service.list_backups(false, None, 0).await?;
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].kind, BackupType::Scheduled);

    let stored = h.settings.get().await?.schedule;
    assert_eq!(stored.last_run_key.as_deref(), Some("2024-05-01|03:00"));

    // Same slot again: deduplicated.
    run_scheduler_tick(&h.service, at_3).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.service.list_backups(false, None, 0).await?.len(), 1);

    // Next day: runs again.
    let next_day = Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 5).unwrap();
    run_scheduler_tick(&h.service, next_day).await?;
    for _ in 0..500 {
        if h.service.list_backups(false, None, 0).await?.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.service.list_backups(false, None, 0).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn upload_validation_and_registration() -> anyhow::Result<()> {
    let h = harness();

    let err = h
        .service
        .upload_backup_file(Actor::system(), "dump.sql", "application/sql", b"", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let err = h
        .service
        .upload_backup_file(Actor::system(), "dump.tar.gz", "application/sql", b"data", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    // Declared content type must be a SQL/text type.
    let err = h
        .service
        .upload_backup_file(Actor::system(), "dump.sql", "application/gzip", DUMP_BODY, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    // Binary content is rejected even under an accepted type.
    let err = h
        .service
        .upload_backup_file(
            Actor::system(),
            "dump.sql",
            "text/plain",
            b"\x7fELF\x00binary",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let backup = h
        .service
        .upload_backup_file(
            Actor::system(),
            "my dump!.sql",
            "text/plain; charset=utf-8",
            DUMP_BODY,
            None,
        )
        .await?;
    assert_eq!(backup.kind, BackupType::Uploaded);
    assert!(backup.filename.ends_with("my_dump_.sql"));
    assert_eq!(tokio::fs::read(&backup.path).await?, DUMP_BODY);
    Ok(())
}

#[tokio::test]
async fn manual_delete_tombstones_and_removes_file() -> anyhow::Result<()> {
    let h = harness();
    let backup = create_backup(&h, None).await;
    let actor = Actor::user(Uuid::new_v4(), "ops@example.com");

    let deleted = h
        .service
        .delete_backup(backup.id, actor.clone(), backupvault::catalog::DeletedReason::Manual)
        .await?;
    assert_eq!(deleted.status, BackupStatus::Deleted);
    assert_eq!(deleted.deleted_by_email.as_deref(), Some("ops@example.com"));
    assert!(tokio::fs::metadata(&backup.path).await.is_err());

    // Hidden from default listings, visible with the flag, idempotent.
    assert!(h.service.list_backups(false, None, 0).await?.is_empty());
    assert_eq!(h.service.list_backups(true, None, 0).await?.len(), 1);
    let again = h
        .service
        .delete_backup(backup.id, actor, backupvault::catalog::DeletedReason::Manual)
        .await?;
    assert_eq!(again.status, BackupStatus::Deleted);
    Ok(())
}
