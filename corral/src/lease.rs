use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use crate::job::{Job, JobId, JobPayload, JobState, RetryLimit, WorkerId};
use crate::queue::InFlightEntry;

/// One-shot deadline attached to an in-flight job.
///
/// Cancelling (or dropping) the timer aborts the sleeping task, so a
/// cancelled deadline never fires.
#[derive(Debug)]
pub struct DeadlineTimer {
    handle: AbortHandle,
}

impl DeadlineTimer {
    /// Arm a timer that runs `on_fire` after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(timeout: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_fire();
        });
        Self {
            handle: task.abort_handle(),
        }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A job currently assigned to a worker.
#[derive(Debug)]
pub struct JobLease<J: JobPayload> {
    pub job: Job<J>,
    pub worker_id: WorkerId,
    pub leased_at: Instant,
    deadline: DeadlineTimer,
}

impl<J: JobPayload> JobLease<J> {
    /// Take the job back out of the lease, cancelling its deadline.
    pub fn release(self) -> Job<J> {
        self.deadline.cancel();
        self.job
    }

    pub fn elapsed(&self) -> Duration {
        self.leased_at.elapsed()
    }
}

/// Jobs assigned to workers, keyed by job id.
///
/// Every entry owns exactly one live deadline timer; removing an entry
/// cancels it.
#[derive(Debug)]
pub struct InFlightTable<J: JobPayload> {
    leases: HashMap<JobId, JobLease<J>>,
}

impl<J: JobPayload> Default for InFlightTable<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: JobPayload> InFlightTable<J> {
    pub fn new() -> Self {
        Self {
            leases: HashMap::new(),
        }
    }

    /// Record `job` as assigned to `worker_id` under `deadline`.
    pub fn insert(&mut self, mut job: Job<J>, worker_id: WorkerId, deadline: DeadlineTimer) {
        job.state = JobState::Assigned;
        job.assigned_worker = Some(worker_id);
        self.leases.insert(
            job.id,
            JobLease {
                job,
                worker_id,
                leased_at: Instant::now(),
                deadline,
            },
        );
    }

    pub fn remove(&mut self, job_id: JobId) -> Option<JobLease<J>> {
        self.leases.remove(&job_id)
    }

    /// Remove every lease held by `worker_id`, oldest job first.
    pub fn take_assigned_to(&mut self, worker_id: WorkerId) -> Vec<JobLease<J>> {
        let mut ids: Vec<JobId> = self
            .leases
            .values()
            .filter(|lease| lease.worker_id == worker_id)
            .map(|lease| lease.job.id)
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.leases.remove(&id))
            .collect()
    }

    /// Remove every lease, e.g. when the coordinator is torn down.
    pub fn drain(&mut self) -> impl Iterator<Item = JobLease<J>> + '_ {
        self.leases.drain().map(|(_, lease)| lease)
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.leases.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Number of jobs currently held by `worker_id`.
    pub fn count_for(&self, worker_id: WorkerId) -> usize {
        self.leases
            .values()
            .filter(|lease| lease.worker_id == worker_id)
            .count()
    }

    pub fn entries(&self) -> Vec<InFlightEntry> {
        let mut entries: Vec<InFlightEntry> = self
            .leases
            .values()
            .map(|lease| InFlightEntry {
                job_id: lease.job.id,
                worker_id: lease.worker_id,
                retries: lease.job.retries,
            })
            .collect();
        entries.sort_by_key(|entry| entry.job_id);
        entries
    }
}

/// What to do with a job whose deadline fired.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ExpiryOutcome {
    /// Re-submit at the front of the queue with the given retry count.
    Retry { retries: u32 },
    /// Fail permanently; the assigned worker is presumed stuck.
    Exhausted { retries: u32 },
}

/// Decide the fate of an expired job that had already been retried
/// `retries` times.
pub fn process_expired_lease(retries: u32, limit: RetryLimit) -> ExpiryOutcome {
    if limit.is_exhausted(retries) {
        ExpiryOutcome::Exhausted { retries }
    } else {
        ExpiryOutcome::Retry {
            retries: retries.saturating_add(1),
        }
    }
}
