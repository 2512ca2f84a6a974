//! PostgreSQL catalog store.
//!
//! Enum fields are stored as text and parsed on the way out; encryption
//! metadata and log details are JSONB. Advisory locks pin their pool
//! connection for the duration of the hold, since PostgreSQL scopes
//! session-level advisory locks to the acquiring connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Backup, BackupFilter, Catalog, NewBackup, NewLogEntry,
};
use crate::crypto::EncryptionMeta;
use crate::errors::Result;

pub struct PgCatalog {
    pool: PgPool,
    lock_conns: Mutex<HashMap<i64, sqlx::pool::PoolConnection<Postgres>>>,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conns: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the catalog tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backups (
                id UUID PRIMARY KEY,
                filename TEXT NOT NULL,
                path TEXT NOT NULL,
                kind TEXT NOT NULL,
                storage TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                sha256 TEXT NOT NULL,
                status TEXT NOT NULL,
                encryption_meta JSONB,
                error_message TEXT,
                created_by_user_id UUID,
                created_by_email TEXT,
                deleted_by_user_id UUID,
                deleted_by_email TEXT,
                deleted_reason TEXT,
                deleted_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS backups_created_at_idx ON backups (created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_logs (
                id UUID PRIMARY KEY,
                backup_id UUID,
                action TEXT NOT NULL,
                actor_user_id UUID,
                actor_email TEXT,
                details JSONB NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn backup_from_row(row: &PgRow) -> Result<Backup> {
    let encryption_meta: Option<EncryptionMeta> = row
        .try_get::<Option<serde_json::Value>, _>("encryption_meta")?
        .map(serde_json::from_value)
        .transpose()?;
    let deleted_reason = row
        .try_get::<Option<String>, _>("deleted_reason")?
        .map(|s| s.parse())
        .transpose()?;

    Ok(Backup {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        path: row.try_get("path")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        storage: row.try_get::<String, _>("storage")?.parse()?,
        size_bytes: row.try_get("size_bytes")?,
        sha256: row.try_get("sha256")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        encryption_meta,
        error_message: row.try_get("error_message")?,
        created_by_user_id: row.try_get("created_by_user_id")?,
        created_by_email: row.try_get("created_by_email")?,
        deleted_by_user_id: row.try_get("deleted_by_user_id")?,
        deleted_by_email: row.try_get("deleted_by_email")?,
        deleted_reason,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn insert_backup(&self, new: NewBackup) -> Result<Backup> {
        let id = Uuid::new_v4();
        let now: DateTime<Utc> = Utc::now();
        let encryption_meta = new
            .encryption_meta
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO backups
                (id, filename, path, kind, storage, size_bytes, sha256, status,
                 encryption_meta, error_message, created_by_user_id, created_by_email,
                 created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            "#,
        )
        .bind(id)
        .bind(&new.filename)
        .bind(&new.path)
        .bind(new.kind.as_str())
        .bind(new.storage.as_str())
        .bind(new.size_bytes)
        .bind(&new.sha256)
        .bind(new.status.as_str())
        .bind(&encryption_meta)
        .bind(&new.error_message)
        .bind(new.created_by.user_id)
        .bind(&new.created_by.email)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Backup {
            id,
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
        })
    }

    async fn find_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        let row = sqlx::query("SELECT * FROM backups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(backup_from_row).transpose()
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM backups
            WHERE ($1 OR status <> 'deleted')
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(filter.include_deleted)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(backup_from_row).collect()
    }

    async fn save_backup(&self, backup: &Backup) -> Result<()> {
        let encryption_meta = backup
            .encryption_meta
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            UPDATE backups SET
                filename = $2, path = $3, kind = $4, storage = $5, size_bytes = $6,
                sha256 = $7, status = $8, encryption_meta = $9, error_message = $10,
                deleted_by_user_id = $11, deleted_by_email = $12, deleted_reason = $13,
                deleted_at = $14, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(backup.id)
        .bind(&backup.filename)
        .bind(&backup.path)
        .bind(backup.kind.as_str())
        .bind(backup.storage.as_str())
        .bind(backup.size_bytes)
        .bind(&backup.sha256)
        .bind(backup.status.as_str())
        .bind(&encryption_meta)
        .bind(&backup.error_message)
        .bind(backup.deleted_by_user_id)
        .bind(&backup.deleted_by_email)
        .bind(backup.deleted_reason.map(|r| r.as_str()))
        .bind(backup.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_backups(&self, include_deleted: bool) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM backups WHERE ($1 OR status <> 'deleted')")
                .bind(include_deleted)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn insert_log(&self, entry: NewLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_logs
                (id, backup_id, action, actor_user_id, actor_email, details, occurred_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.backup_id)
        .bind(entry.action.as_str())
        .bind(entry.actor.user_id)
        .bind(&entry.actor.email)
        .bind(&entry.details)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool> {
        let mut held = self.lock_conns.lock().await;
        if held.contains_key(&key) {
            // This process already holds the lock.
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            // The lock lives on this session; keep the connection out of the
            // pool until unlock.
            held.insert(key, conn);
        }
        Ok(acquired)
    }

    async fn advisory_unlock(&self, key: i64) -> Result<()> {
        let conn = self.lock_conns.lock().await.remove(&key);
        if let Some(mut conn) = conn {
            sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await?;
        }
        Ok(())
    }
}
