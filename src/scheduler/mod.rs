//! Timezone-aware backup scheduler.
//!
//! A tick matches the current minute against the configured `HH:MM` slots in
//! the schedule's IANA timezone. Slot runs are deduplicated by a stored
//! `date|time` key, and ticks across instances are serialized by a catalog
//! advisory lock. The schedule is re-read after the lock is acquired so a
//! concurrent admin edit between check and lock cannot trigger a stale run.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::Duration;

use crate::catalog::{Actor, BackupType, Catalog};
use crate::config::ScheduleSettings;
use crate::errors::Result;
use crate::service::BackupService;

/// Fixed advisory lock key; distinct from the retention engine's.
pub const SCHEDULER_LOCK_KEY: i64 = 815_002;

/// A slot that should run now, if any: the matched `HH:MM` and its
/// de-duplication key.
fn due_slot(schedule: &ScheduleSettings, now: DateTime<Utc>) -> Option<(String, String)> {
    if !schedule.enabled {
        return None;
    }
    let tz: Tz = match schedule.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            // Rejected on update; tolerated here in case of a hand-edited row.
            eprintln!(
                "⚠️ Scheduler: unknown timezone '{}', skipping tick",
                schedule.timezone
            );
            return None;
        }
    };

    let local = now.with_timezone(&tz);
    let current = local.format("%H:%M").to_string();
    let date = local.format("%Y-%m-%d").to_string();

    let slot = schedule.slots().into_iter().find(|t| *t == current)?;
    // Legacy single-time schedules dedupe by calendar day, multi-time
    // schedules by day and slot.
    let run_key = if schedule.is_legacy() {
        date
    } else {
        format!("{}|{}", date, slot)
    };
    if schedule.last_run_key.as_deref() == Some(run_key.as_str()) {
        return None;
    }
    Some((slot, run_key))
}

/// One scheduler tick at the given instant. Testable without a clock; the
/// daemon loop passes `Utc::now()`.
pub async fn run_scheduler_tick(service: &BackupService, now: DateTime<Utc>) -> Result<()> {
    let schedule = service.get_settings().await?.schedule;
    if due_slot(&schedule, now).is_none() {
        return Ok(());
    }

    if !service.catalog().try_advisory_lock(SCHEDULER_LOCK_KEY).await? {
        return Ok(());
    }
    let outcome = run_due_slot(service, now).await;
    let unlock = service.catalog().advisory_unlock(SCHEDULER_LOCK_KEY).await;
    outcome?;
    unlock
}

/// The lock-guarded half of a tick: re-read, re-validate, kick, persist.
async fn run_due_slot(service: &BackupService, now: DateTime<Utc>) -> Result<()> {
    let mut settings = service.get_settings().await?;
    let (slot, run_key) = match due_slot(&settings.schedule, now) {
        Some(due) => due,
        // Another instance ran the slot between our check and the lock.
        None => return Ok(()),
    };

    println!("⏰ Scheduled backup triggered for slot {}", slot);
    let password = settings
        .schedule
        .encryption_password
        .clone()
        .filter(|p| !p.trim().is_empty());
    let job = service
        .start_create_backup_job(Actor::system(), BackupType::Scheduled, password)
        .await;
    println!("⏰ Scheduled backup job {} started", job.id);

    settings.schedule.last_run_key = Some(run_key);
    settings.schedule.last_run_at = Some(now);
    service.put_settings(settings).await
}

/// Periodic scheduler loop for the daemon.
pub fn spawn_scheduler_loop(service: BackupService, tick: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = run_scheduler_tick(&service, Utc::now()).await {
                eprintln!("⚠️ Scheduler tick failed: {}", e);
            }
        }
    })
}
