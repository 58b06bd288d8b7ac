use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pyrelay_core::machine::{self, JobUpdate};
use pyrelay_core::{Job, JobId, JobKind, JobStatus};
use time::OffsetDateTime;

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub analyses: usize,
}

/// In-memory job table. All status changes go through the CAS-guarded
/// state machine.
#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a fresh record and return the id it was stored under.
    ///
    /// An existing record is never touched. If the minted id is already
    /// taken (identical input within one millisecond), the new job gets a
    /// `-<n>` suffix instead.
    pub fn insert(&self, mut job: Job) -> JobId {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            let base = job.id.clone();
            let mut n = 1u32;
            while jobs.contains_key(&format!("{base}-{n}")) {
                n += 1;
            }
            job.id = format!("{base}-{n}");
            tracing::debug!(job_id = %base, assigned = %job.id, "job id collision");
        }
        let id = job.id.clone();
        jobs.insert(id.clone(), job);
        id
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().get(id).cloned()
    }

    /// CAS transition. Ok(false) when the job is missing or not in `from`.
    pub fn transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        update: Option<JobUpdate>,
    ) -> anyhow::Result<bool> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };
        machine::transition(job, from, to, update, OffsetDateTime::now_utc())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.lock().values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
            if job.kind == JobKind::Analyze {
                counts.analyses += 1;
            }
        }
        counts
    }

    /// Drop records created more than `retention` before `now`. Returns how
    /// many were removed.
    pub fn sweep(&self, now: OffsetDateTime, retention: Duration) -> usize {
        let cutoff = now - retention;
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| job.created_at >= cutoff);
        before - jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrelay_core::JobOutput;

    fn job(id: &str, created: OffsetDateTime) -> Job {
        Job::new(id.into(), JobKind::Analyze, "u1", "print(1)", created)
    }

    #[test]
    fn insert_get_and_transition() {
        let store = JobStore::new();
        store.insert(job("ana_1_aaaaaaaa", OffsetDateTime::now_utc()));

        assert!(store
            .transition("ana_1_aaaaaaaa", JobStatus::Queued, JobStatus::Running, None)
            .unwrap());
        let update = JobUpdate::with_result(JobOutput::Analysis {
            analysis: "ok".into(),
        });
        assert!(store
            .transition(
                "ana_1_aaaaaaaa",
                JobStatus::Running,
                JobStatus::Completed,
                Some(update)
            )
            .unwrap());

        let stored = store.get("ana_1_aaaaaaaa").unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result.unwrap().as_analysis(), Some("ok"));
    }

    #[test]
    fn terminal_status_never_reverts() {
        let store = JobStore::new();
        store.insert(job("j", OffsetDateTime::now_utc()));
        store
            .transition("j", JobStatus::Queued, JobStatus::Failed, None)
            .unwrap();
        // CAS miss: job is no longer queued.
        assert!(!store
            .transition("j", JobStatus::Queued, JobStatus::Running, None)
            .unwrap());
        // Terminal state has no outgoing edges.
        assert!(store
            .transition("j", JobStatus::Failed, JobStatus::Running, None)
            .is_err());
        assert_eq!(store.get("j").unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn missing_job_transition_is_a_miss() {
        let store = JobStore::new();
        assert!(!store
            .transition("nope", JobStatus::Queued, JobStatus::Running, None)
            .unwrap());
    }

    #[test]
    fn colliding_id_never_resets_running_job() {
        let store = JobStore::new();
        assert_eq!(store.insert(job("same", OffsetDateTime::now_utc())), "same");
        store
            .transition("same", JobStatus::Queued, JobStatus::Running, None)
            .unwrap();

        let second = store.insert(job("same", OffsetDateTime::now_utc()));
        let third = store.insert(job("same", OffsetDateTime::now_utc()));
        assert_eq!(second, "same-1");
        assert_eq!(third, "same-2");
        assert_eq!(store.len(), 3);
        assert_eq!(store.get("same").unwrap().status, JobStatus::Running);
        assert_eq!(store.get("same-1").unwrap().id, "same-1");
        assert_eq!(store.get("same-2").unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn counts_by_status() {
        let store = JobStore::new();
        let now = OffsetDateTime::now_utc();
        store.insert(job("a", now));
        store.insert(job("b", now));
        store.insert(Job::new("c".into(), JobKind::Execute, "u1", "x", now));
        store
            .transition("b", JobStatus::Queued, JobStatus::Running, None)
            .unwrap();
        let counts = store.counts();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.analyses, 2);
    }

    #[test]
    fn sweep_drops_old_jobs_only() {
        let store = JobStore::new();
        let now = OffsetDateTime::now_utc();
        store.insert(job("old", now - Duration::from_secs(25 * 3600)));
        store.insert(job("new", now - Duration::from_secs(3600)));
        let removed = store.sweep(now, Duration::from_secs(24 * 3600));
        assert_eq!(removed, 1);
        assert!(store.get("old").is_none());
        assert!(store.get("new").is_some());
    }
}
