//! Backup creation pipeline.
//!
//! `start_create_backup_job` returns a job handle immediately; the pipeline
//! continues in a detached task. A failure at any stage before the catalog
//! write leaves no record behind, so partial backups are never visible.

use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;

use super::BackupService;
use crate::catalog::{
    log_event, Actor, Backup, BackupStatus, BackupType, LogAction, NewBackup, StorageLocation,
};
use crate::crypto;
use crate::errors::Result;
use crate::jobs::{Job, JobKind, JobStage, JobUpdate};

/// Deterministic timestamped name with a random suffix so concurrent jobs
/// never collide.
pub fn backup_filename() -> String {
    format!(
        "db_backup_{}_{:04x}.sql",
        Utc::now().format("%Y%m%d_%H%M%S"),
        rand::random::<u16>()
    )
}

impl BackupService {
    /// Kicks off a backup creation job and returns its handle without
    /// waiting for the pipeline.
    pub async fn start_create_backup_job(
        &self,
        actor: Actor,
        kind: BackupType,
        encryption_password: Option<String>,
    ) -> Job {
        let job = self.jobs().create(JobKind::Create);
        self.jobs().update(
            &job.id,
            JobUpdate::stage(JobStage::Preparing, 5, "Preparing backup"),
        );

        let service = self.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            service
                .run_create_to_completion(&job_id, actor, kind, encryption_password.as_deref())
                .await;
        });

        self.jobs().get(&job.id).unwrap_or(job)
    }

    /// Runs the full creation pipeline for an already-registered job and
    /// finishes it. Called from the detached task above and inline by the
    /// restore pipeline's safety snapshot.
    pub async fn run_create_to_completion(
        &self,
        job_id: &str,
        actor: Actor,
        kind: BackupType,
        encryption_password: Option<&str>,
    ) -> Option<Backup> {
        match self
            .run_create_pipeline(job_id, &actor, kind, encryption_password)
            .await
        {
            Ok(backup) => {
                self.jobs().finish(
                    job_id,
                    JobUpdate {
                        stage: Some(JobStage::Done),
                        percent: Some(100),
                        message: Some("Backup completed".to_string()),
                        backup_id: Some(backup.id),
                        ..Default::default()
                    },
                );
                println!(
                    "✅ Backup {} created ({} bytes)",
                    backup.filename, backup.size_bytes
                );
                self.spawn_remote_sync(backup.id);
                self.spawn_retention_pass();
                Some(backup)
            }
            Err(e) => {
                eprintln!("❌ Backup job {} failed: {}", job_id, e);
                self.jobs().finish(
                    job_id,
                    JobUpdate {
                        stage: Some(JobStage::Failed),
                        message: Some("Backup failed".to_string()),
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                );
                None
            }
        }
    }

    async fn run_create_pipeline(
        &self,
        job_id: &str,
        actor: &Actor,
        kind: BackupType,
        encryption_password: Option<&str>,
    ) -> Result<Backup> {
        self.jobs().update(
            job_id,
            JobUpdate::stage(JobStage::Preparing, 10, "Preparing backup directory"),
        );
        tokio::fs::create_dir_all(self.backup_dir()).await?;
        let filename = backup_filename();
        let path: PathBuf = self.backup_dir().join(&filename);

        self.jobs().update(
            job_id,
            JobUpdate::stage(JobStage::Running, 30, "Dumping database"),
        );
        self.engine().dump_to_file(&path).await?;

        let encryption_meta = match encryption_password {
            Some(password) => {
                self.jobs().update(
                    job_id,
                    JobUpdate::stage(JobStage::Hashing, 60, "Encrypting backup"),
                );
                match crypto::encrypt_file_in_place(&path, password, None).await {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        let _ = tokio::fs::remove_file(&path).await;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        self.jobs().update(
            job_id,
            JobUpdate::stage(JobStage::Hashing, 75, "Hashing backup file"),
        );
        let sha256 = match crypto::sha256_file(&path).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };
        let size_bytes = tokio::fs::metadata(&path).await?.len() as i64;

        self.jobs().update(
            job_id,
            JobUpdate::stage(JobStage::Saving, 90, "Recording backup"),
        );
        let backup = self
            .catalog()
            .insert_backup(NewBackup {
                filename: filename.clone(),
                path: path.display().to_string(),
                kind,
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
            self.catalog(),
            Some(backup.id),
            LogAction::BackupCreated,
            actor,
            json!({
                "kind": kind.as_str(),
                "filename": filename,
                "size_bytes": size_bytes,
                "encrypted": backup.is_encrypted(),
            }),
        )
        .await;

        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_filename_shape() {
        let name = backup_filename();
        assert!(name.starts_with("db_backup_"));
        assert!(name.ends_with(".sql"));
        assert_ne!(backup_filename(), backup_filename());
    }
}
