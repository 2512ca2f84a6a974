//! In-memory registry of long-running create/restore jobs.
//!
//! Jobs are ephemeral: they live in process memory only and are lost on
//! restart. Clients poll a job by the id returned at kickoff; there is no
//! listing. The registry is bounded — once it exceeds its cap, the oldest
//! finished jobs are evicted (running jobs are never evicted).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const MAX_TRACKED_JOBS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Create,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Starting,
    Preparing,
    Running,
    Hashing,
    Saving,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub stage: JobStage,
    pub percent: u8,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub backup_id: Option<Uuid>,
}

impl Job {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Partial update; unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub stage: Option<JobStage>,
    pub percent: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub backup_id: Option<Uuid>,
}

impl JobUpdate {
    pub fn stage(stage: JobStage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            percent: Some(percent),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Default)]
pub struct JobTracker {
    inner: Arc<Mutex<HashMap<String, Job>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, kind: JobKind) -> Job {
        let id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let job = Job {
            id: id.clone(),
            kind,
            stage: JobStage::Starting,
            percent: 0,
            message: "Starting".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            backup_id: None,
        };
        let mut jobs = self.inner.lock().unwrap();
        if jobs.len() >= MAX_TRACKED_JOBS {
            evict_oldest_finished(&mut jobs);
        }
        jobs.insert(id, job.clone());
        job
    }

    pub fn update(&self, id: &str, update: JobUpdate) {
        let mut jobs = self.inner.lock().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            apply(job, update);
        }
    }

    /// Applies the update and marks the job terminal; `finished_at` is set
    /// exactly once.
    pub fn finish(&self, id: &str, update: JobUpdate) {
        let mut jobs = self.inner.lock().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            apply(job, update);
            if job.finished_at.is_none() {
                job.finished_at = Some(Utc::now());
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.inner.lock().unwrap().get(id).cloned()
    }
}

fn apply(job: &mut Job, update: JobUpdate) {
    if let Some(stage) = update.stage {
        job.stage = stage;
    }
    if let Some(percent) = update.percent {
        job.percent = percent;
    }
    if let Some(message) = update.message {
        job.message = message;
    }
    if let Some(error) = update.error {
        job.error = Some(error);
    }
    if let Some(backup_id) = update.backup_id {
        job.backup_id = Some(backup_id);
    }
}

fn evict_oldest_finished(jobs: &mut HashMap<String, Job>) {
    let mut finished: Vec<(String, DateTime<Utc>)> = jobs
        .values()
        .filter_map(|j| j.finished_at.map(|at| (j.id.clone(), at)))
        .collect();
    finished.sort_by_key(|(_, at)| *at);
    // Free a quarter of the capacity at once so eviction is not per-insert.
    for (id, _) in finished.into_iter().take(MAX_TRACKED_JOBS / 4) {
        jobs.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_assigns_unique_ids() {
        let tracker = JobTracker::new();
        let a = tracker.create(JobKind::Create);
        let b = tracker.create(JobKind::Create);
        assert_ne!(a.id, b.id);
        assert_eq!(a.stage, JobStage::Starting);
        assert!(tracker.get(&a.id).is_some());
        assert!(tracker.get("nope").is_none());
    }

    #[test]
    fn test_update_merges_partial_fields() {
        let tracker = JobTracker::new();
        let job = tracker.create(JobKind::Restore);

        tracker.update(
            &job.id,
            JobUpdate::stage(JobStage::Running, 40, "Applying dump"),
        );
        tracker.update(
            &job.id,
            JobUpdate {
                percent: Some(55),
                ..Default::default()
            },
        );

        let current = tracker.get(&job.id).unwrap();
        assert_eq!(current.stage, JobStage::Running);
        assert_eq!(current.percent, 55);
        assert_eq!(current.message, "Applying dump");
        assert!(current.finished_at.is_none());
    }

    #[test]
    fn test_finish_sets_finished_at_once() {
        let tracker = JobTracker::new();
        let job = tracker.create(JobKind::Create);

        tracker.finish(&job.id, JobUpdate::stage(JobStage::Done, 100, "Completed"));
        let first = tracker.get(&job.id).unwrap().finished_at.unwrap();

        tracker.finish(
            &job.id,
            JobUpdate {
                error: Some("late".to_string()),
                ..Default::default()
            },
        );
        let second = tracker.get(&job.id).unwrap().finished_at.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_failed_job_keeps_error_and_no_backup_id() {
        let tracker = JobTracker::new();
        let job = tracker.create(JobKind::Create);
        tracker.finish(
            &job.id,
            JobUpdate {
                stage: Some(JobStage::Failed),
                error: Some("pg_dump exited with code 1".to_string()),
                ..Default::default()
            },
        );

        let current = tracker.get(&job.id).unwrap();
        assert_eq!(current.stage, JobStage::Failed);
        assert_eq!(current.error.as_deref(), Some("pg_dump exited with code 1"));
        assert!(current.backup_id.is_none());
    }

    #[test]
    fn test_eviction_only_touches_finished_jobs() {
        let tracker = JobTracker::new();
        let running = tracker.create(JobKind::Create);
        for _ in 0..MAX_TRACKED_JOBS {
            let j = tracker.create(JobKind::Create);
            tracker.finish(&j.id, JobUpdate::stage(JobStage::Done, 100, "Completed"));
        }
        // The cap was crossed, so some finished jobs were evicted; the
        // running one must survive.
        assert!(tracker.get(&running.id).is_some());
    }
}
