use anyhow::{bail, Result};
use time::OffsetDateTime;

use crate::types::{Job, JobOutput, JobStatus};

// ── Valid transitions ──

const VALID_TRANSITIONS: &[(JobStatus, &[JobStatus])] = &[
    (
        JobStatus::Queued,
        // queued → failed: rejected before any work started
        &[JobStatus::Running, JobStatus::Failed],
    ),
    (
        JobStatus::Running,
        &[JobStatus::Completed, JobStatus::Failed],
    ),
    // Completed and Failed are terminal
];

pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

// ── Side effects ──

/// Optional data applied together with a transition.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub result: Option<JobOutput>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn with_result(result: JobOutput) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn apply(self, job: &mut Job) {
        if self.result.is_some() {
            job.result = self.result;
        }
        if self.error.is_some() {
            job.error = self.error;
        }
    }
}

// ── CAS-guarded transition ──

/// Move `job` from `from` to `to`, applying side effects and timestamps.
/// Returns Ok(true) on success, Ok(false) on CAS miss (current != from).
pub fn transition(
    job: &mut Job,
    from: JobStatus,
    to: JobStatus,
    side_effect: Option<JobUpdate>,
    now: OffsetDateTime,
) -> Result<bool> {
    if job.status != from {
        return Ok(false);
    }
    if !is_valid_transition(from, to) {
        bail!("invalid transition: {} {from:?} → {to:?}", job.id);
    }
    job.status = to;
    job.updated_at = now;
    if to == JobStatus::Running {
        job.started_at = Some(now);
    }
    if to.is_terminal() {
        job.finished_at = Some(now);
    }
    if let Some(update) = side_effect {
        update.apply(job);
    }
    Ok(true)
}
