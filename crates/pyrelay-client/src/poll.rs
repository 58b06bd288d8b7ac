use std::time::Duration;

use pyrelay_core::config::ClientConfig;
use pyrelay_core::{Job, JobStatus};

use crate::ClientError;

/// Bounded polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(2),
        }
    }
}

impl PollPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            attempts: config.poll_attempts.max(1),
            interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// How polling a job ended.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Completed(Job),
    Failed(Job),
    /// Budget exhausted while the job was still queued or running.
    TimedOut,
    /// Unknown or expired job id.
    NotFound,
}

impl PollOutcome {
    pub fn job(&self) -> Option<&Job> {
        match self {
            PollOutcome::Completed(job) | PollOutcome::Failed(job) => Some(job),
            PollOutcome::TimedOut | PollOutcome::NotFound => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PollOutcome::Completed(_))
    }
}

/// Call `fetch` until it yields a terminal job or the budget runs out.
///
/// Every attempt, the first included, waits `policy.interval` before
/// fetching. `fetch` returns `Ok(None)` for an unknown id. Transport errors
/// count as an attempt and polling continues.
pub fn poll_until_terminal<F>(policy: PollPolicy, mut fetch: F) -> PollOutcome
where
    F: FnMut() -> Result<Option<Job>, ClientError>,
{
    for attempt in 1..=policy.attempts {
        std::thread::sleep(policy.interval);
        match fetch() {
            Ok(Some(job)) => match job.status {
                JobStatus::Completed => return PollOutcome::Completed(job),
                JobStatus::Failed => return PollOutcome::Failed(job),
                JobStatus::Queued | JobStatus::Running => {
                    tracing::debug!(job_id = %job.id, attempt, status = job.status.as_str(), "still waiting");
                }
            },
            Ok(None) => return PollOutcome::NotFound,
            Err(e) => tracing::debug!(attempt, error = %e, "poll attempt failed"),
        }
    }
    PollOutcome::TimedOut
}
