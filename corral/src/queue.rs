use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::job::{Job, JobId, JobPayload, WorkerId};
use crate::pool::WorkerState;

/// Pending jobs waiting for an idle worker.
///
/// Tail insertion is FIFO. Head insertion is reserved for retries and crash
/// re-submissions; successive head insertions stack, so the most recent one
/// is served first.
#[derive(Debug)]
pub struct JobQueue<J: JobPayload> {
    jobs: VecDeque<Job<J>>,
}

impl<J: JobPayload> Default for JobQueue<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: JobPayload> JobQueue<J> {
    pub fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, job: Job<J>, to_front: bool) {
        if to_front {
            self.jobs.push_front(job);
        } else {
            self.jobs.push_back(job);
        }
    }

    pub fn dequeue(&mut self) -> Option<Job<J>> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Ids in dispatch order.
    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|job| job.id).collect()
    }

    /// Remove every pending job, e.g. when the coordinator is torn down.
    pub fn drain(&mut self) -> impl Iterator<Item = Job<J>> + '_ {
        self.jobs.drain(..)
    }
}

/// Point-in-time view of the coordinator's queues and pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub running: bool,
    /// Pending job ids in dispatch order.
    pub pending: Vec<JobId>,
    pub in_flight: Vec<InFlightEntry>,
    /// Idle slots queued for dispatch, oldest first.
    pub idle_slots: Vec<WorkerId>,
    pub workers: Vec<WorkerSnapshot>,
}

impl PoolSnapshot {
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle_slots.len()
    }

    /// Workers that are neither exiting nor dead.
    pub fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !matches!(w.state, WorkerState::Exiting | WorkerState::Dead))
            .count()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InFlightEntry {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub retries: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub state: WorkerState,
    pub connected: bool,
    pub busy_slots: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Completion;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Noop;

    impl JobPayload for Noop {
        type Output = ();

        fn executor(&self) -> &str {
            "noop"
        }
    }

    fn job(id: u64) -> Job<Noop> {
        let (tx, _rx) = tokio::sync::oneshot::channel();
        Job::new(JobId(id), Noop, 0, Completion::Channel(tx))
    }

    #[test]
    fn tail_insertions_are_fifo() {
        let mut queue = JobQueue::new();
        for id in 0..4 {
            queue.enqueue(job(id), false);
        }
        assert_eq!(queue.ids(), vec![JobId(0), JobId(1), JobId(2), JobId(3)]);
        assert_eq!(queue.dequeue().map(|j| j.id), Some(JobId(0)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn head_insertions_jump_ahead_and_stack() {
        let mut queue = JobQueue::new();
        queue.enqueue(job(0), false);
        queue.enqueue(job(1), false);
        queue.enqueue(job(10), true);
        queue.enqueue(job(11), true);
        assert_eq!(
            queue.ids(),
            vec![JobId(11), JobId(10), JobId(0), JobId(1)]
        );
    }

    #[test]
    fn empty_queue_dequeues_nothing() {
        let mut queue: JobQueue<Noop> = JobQueue::new();
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn drain_empties_queue() {
        let mut queue = JobQueue::new();
        queue.enqueue(job(0), false);
        queue.enqueue(job(1), true);
        assert_eq!(queue.drain().count(), 2);
        assert!(queue.is_empty());
    }
}
