//! In-memory catalog used by tests and single-process development runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    Backup, BackupFilter, BackupLog, BackupStatus, Catalog, NewBackup, NewLogEntry,
};
use crate::errors::{AppError, Result};

#[derive(Default)]
struct State {
    backups: Vec<Backup>,
    logs: Vec<BackupLog>,
    held_locks: HashSet<i64>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites a backup's creation time; test support for age-based rules.
    pub fn backdate(&self, id: Uuid, created_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(backup) = state.backups.iter_mut().find(|b| b.id == id) {
            backup.created_at = created_at;
        }
    }

    /// Snapshot of the audit trail, newest last.
    pub fn logs(&self) -> Vec<BackupLog> {
        self.state.lock().unwrap().logs.clone()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn insert_backup(&self, new: NewBackup) -> Result<Backup> {
        let now = Utc::now();
        let backup = Backup {
            id: Uuid::new_v4(),
            filename: new.filename,
            path: new.path,
            kind: new.kind,
            storage: new.storage,
            size_bytes: new.size_bytes,
            sha256: new.sha256,
            status: new.status,
            encryption_meta: new.encryption_meta,
            error_message: new.error_message,
            created_by_user_id: new.created_by.user_id,
            created_by_email: new.created_by.email,
            deleted_by_user_id: None,
            deleted_by_email: None,
            deleted_reason: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().backups.push(backup.clone());
        Ok(backup)
    }

    async fn find_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .backups
            .iter()
            .find(|b| b.id == id)
            .cloned())
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>> {
        let state = self.state.lock().unwrap();
        let mut matched: Vec<Backup> = state
            .backups
            .iter()
            .filter(|b| filter.include_deleted || b.status != BackupStatus::Deleted)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matched
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn save_backup(&self, backup: &Backup) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .backups
            .iter_mut()
            .find(|b| b.id == backup.id)
            .ok_or_else(|| AppError::NotFound(format!("backup {}", backup.id)))?;
        let mut updated = backup.clone();
        updated.updated_at = Utc::now();
        *slot = updated;
        Ok(())
    }

    async fn count_backups(&self, include_deleted: bool) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .backups
            .iter()
            .filter(|b| include_deleted || b.status != BackupStatus::Deleted)
            .count() as i64)
    }

    async fn insert_log(&self, entry: NewLogEntry) -> Result<()> {
        let log = BackupLog {
            id: Uuid::new_v4(),
            backup_id: entry.backup_id,
            action: entry.action,
            actor_user_id: entry.actor.user_id,
            actor_email: entry.actor.email,
            details: entry.details,
            occurred_at: Utc::now(),
        };
        self.state.lock().unwrap().logs.push(log);
        Ok(())
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool> {
        Ok(self.state.lock().unwrap().held_locks.insert(key))
    }

    async fn advisory_unlock(&self, key: i64) -> Result<()> {
        self.state.lock().unwrap().held_locks.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Actor, BackupType, StorageLocation};

    fn new_backup(name: &str) -> NewBackup {
        NewBackup {
            filename: name.to_string(),
            path: format!("/backups/{}", name),
            kind: BackupType::Manual,
            storage: StorageLocation::Local,
            size_bytes: 42,
            sha256: "deadbeef".to_string(),
            status: BackupStatus::Ready,
            encryption_meta: None,
            error_message: None,
            created_by: Actor::system(),
        }
    }

    #[tokio::test]
    async fn test_listing_excludes_deleted_by_default() -> anyhow::Result<()> {
        let catalog = MemoryCatalog::new();
        let a = catalog.insert_backup(new_backup("a.sql")).await?;
        catalog.insert_backup(new_backup("b.sql")).await?;

        let mut deleted = a.clone();
        deleted.status = BackupStatus::Deleted;
        catalog.save_backup(&deleted).await?;

        let visible = catalog.list_backups(&BackupFilter::default()).await?;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].filename, "b.sql");

        let all = catalog
            .list_backups(&BackupFilter {
                include_deleted: true,
                ..Default::default()
            })
            .await?;
        assert_eq!(all.len(), 2);
        assert_eq!(catalog.count_backups(false).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_is_newest_first() -> anyhow::Result<()> {
        let catalog = MemoryCatalog::new();
        let old = catalog.insert_backup(new_backup("old.sql")).await?;
        let new = catalog.insert_backup(new_backup("new.sql")).await?;
        catalog.backdate(old.id, Utc::now() - chrono::Duration::days(2));
        catalog.backdate(new.id, Utc::now() - chrono::Duration::days(1));

        let listed = catalog.list_backups(&BackupFilter::default()).await?;
        assert_eq!(listed[0].filename, "new.sql");
        assert_eq!(listed[1].filename, "old.sql");
        Ok(())
    }

    #[tokio::test]
    async fn test_advisory_lock_is_exclusive() -> anyhow::Result<()> {
        let catalog = MemoryCatalog::new();
        assert!(catalog.try_advisory_lock(7).await?);
        assert!(!catalog.try_advisory_lock(7).await?);
        catalog.advisory_unlock(7).await?;
        assert!(catalog.try_advisory_lock(7).await?);
        Ok(())
    }
}
