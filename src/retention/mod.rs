//! Automatic deletion of backups per the retention policy.
//!
//! A pass runs every tick and after each successful backup creation. Passes
//! across all instances are serialized by a catalog advisory lock; an
//! instance that fails to acquire it skips the tick outright.

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use crate::catalog::{Actor, Backup, BackupFilter, Catalog, DeletedReason, DEFAULT_PAGE_SIZE};
use crate::config::{RetentionPeriod, RetentionSettings};
use crate::errors::Result;
use crate::service::BackupService;

/// Fixed advisory lock key; distinct from the scheduler's.
pub const RETENTION_LOCK_KEY: i64 = 815_001;

/// Hard ceiling on the protected newest-N set, whatever `keep_last` says.
const KEEP_LAST_CEILING: usize = 5000;

/// One full retention pass. A failed lock acquisition is a silent skip.
pub async fn run_retention_pass(service: &BackupService) -> Result<()> {
    let retention = service.get_settings().await?.retention.normalized();
    if !retention.time_enabled && !retention.count_enabled {
        return Ok(());
    }

    if !service.catalog().try_advisory_lock(RETENTION_LOCK_KEY).await? {
        return Ok(());
    }
    let outcome = delete_expired(service, &retention).await;
    let unlock = service.catalog().advisory_unlock(RETENTION_LOCK_KEY).await;
    outcome?;
    unlock
}

async fn delete_expired(service: &BackupService, retention: &RetentionSettings) -> Result<()> {
    let candidates = collect_candidates(service, retention, Utc::now()).await?;
    if candidates.is_empty() {
        return Ok(());
    }

    println!(
        "🧹 Retention pass: {} backup(s) eligible for deletion",
        candidates.len()
    );
    for id in candidates {
        // One bad record must not stop the rest of the pass.
        if let Err(e) = service
            .delete_backup(id, Actor::system(), DeletedReason::Retention)
            .await
        {
            eprintln!("⚠️ Retention failed to delete backup {}: {}", id, e);
        }
    }
    Ok(())
}

/// Walks all non-deleted backups newest-first in pages and applies both
/// rules. The newest `keep_last` backups are protected from either rule
/// while the count rule is enabled.
async fn collect_candidates(
    service: &BackupService,
    retention: &RetentionSettings,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>> {
    let protected_n = if retention.count_enabled {
        (retention.keep_last as usize).min(KEEP_LAST_CEILING)
    } else {
        0
    };
    let cutoff = if retention.time_enabled {
        cutoff_for(retention.period, now)
    } else {
        None
    };

    let mut candidates = Vec::new();
    let mut seen = HashSet::new();
    let mut rank = 0usize;
    let mut offset = 0i64;
    loop {
        let page = service
            .catalog()
            .list_backups(&BackupFilter {
                include_deleted: false,
                limit: DEFAULT_PAGE_SIZE,
                offset,
            })
            .await?;
        if page.is_empty() {
            break;
        }
        offset += page.len() as i64;

        for backup in &page {
            let protected = rank < protected_n;
            rank += 1;
            if protected {
                continue;
            }
            if is_candidate(backup, retention, cutoff) && seen.insert(backup.id) {
                candidates.push(backup.id);
            }
        }
        if (page.len() as i64) < DEFAULT_PAGE_SIZE {
            break;
        }
    }
    Ok(candidates)
}

fn is_candidate(
    backup: &Backup,
    retention: &RetentionSettings,
    cutoff: Option<DateTime<Utc>>,
) -> bool {
    // Beyond the protected set, the count rule alone makes it eligible.
    if retention.count_enabled {
        return true;
    }
    match cutoff {
        Some(cutoff) => backup.created_at < cutoff,
        None => false,
    }
}

/// Cutoff for the time rule. Month-granularity periods use calendar-month
/// subtraction to preserve day-of-month semantics; `never` has no cutoff.
pub fn cutoff_for(period: RetentionPeriod, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match period {
        RetentionPeriod::OneMinute => Some(now - ChronoDuration::seconds(60)),
        RetentionPeriod::Weekly => Some(now - ChronoDuration::days(7)),
        RetentionPeriod::Monthly => now.checked_sub_months(Months::new(1)),
        RetentionPeriod::TwoMonths => now.checked_sub_months(Months::new(2)),
        RetentionPeriod::ThreeMonths => now.checked_sub_months(Months::new(3)),
        RetentionPeriod::SixMonths => now.checked_sub_months(Months::new(6)),
        RetentionPeriod::Yearly => now.checked_sub_months(Months::new(12)),
        RetentionPeriod::Never => None,
    }
}

/// Periodic retention loop for the daemon.
pub fn spawn_retention_loop(service: BackupService, tick: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = run_retention_pass(&service).await {
                eprintln!("⚠️ Retention pass failed: {}", e);
            }
        }
    })
}
