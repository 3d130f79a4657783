use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{CorralError, Result};
use crate::ipc::CoordinatorMessage;
use crate::job::{JobPayload, WorkerId};
use crate::queue::WorkerSnapshot;
use crate::runtime::transport::WorkerLink;

/// Coordinator-side view of a worker's lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Spawned, has not announced readiness yet.
    Starting,
    /// At least one concurrency slot is free.
    Idle,
    /// Every announced slot holds a job.
    Busy,
    /// Reported its final job or was told to exit; takes no new work.
    Exiting,
    /// Channel closed; only reported until the exit is processed.
    Dead,
}

struct WorkerEntry<J: JobPayload> {
    state: WorkerState,
    link: Box<dyn WorkerLink<J>>,
    busy_slots: usize,
}

/// Live workers plus the FIFO of idle concurrency slots.
///
/// A worker with several slots appears once in the idle queue per free slot.
/// Slot tokens of workers that disconnected or started exiting are dropped
/// lazily by [`WorkerPool::next_idle`].
pub struct WorkerPool<J: JobPayload> {
    workers: HashMap<WorkerId, WorkerEntry<J>>,
    idle: VecDeque<WorkerId>,
}

impl<J: JobPayload> Default for WorkerPool<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: JobPayload> std::fmt::Debug for WorkerPool<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("idle_slots", &self.idle.len())
            .finish()
    }
}

impl<J: JobPayload> WorkerPool<J> {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
            idle: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, worker_id: WorkerId, link: Box<dyn WorkerLink<J>>) {
        self.workers.insert(
            worker_id,
            WorkerEntry {
                state: WorkerState::Starting,
                link,
                busy_slots: 0,
            },
        );
    }

    /// Record one free slot announced by `worker_id`.
    ///
    /// Returns `false` when the worker is unknown or no longer accepts work.
    pub fn mark_ready(&mut self, worker_id: WorkerId) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(entry)
                if !matches!(entry.state, WorkerState::Exiting | WorkerState::Dead) =>
            {
                entry.state = WorkerState::Idle;
                self.idle.push_back(worker_id);
                true
            }
            _ => false,
        }
    }

    /// Pop the oldest idle slot whose worker can still take a job.
    ///
    /// Slots of unknown, exiting or disconnected workers are discarded.
    pub fn next_idle(&mut self) -> Option<WorkerId> {
        while let Some(worker_id) = self.idle.pop_front() {
            match self.workers.get(&worker_id) {
                Some(entry)
                    if entry.state == WorkerState::Idle && entry.link.is_connected() =>
                {
                    return Some(worker_id);
                }
                _ => {
                    tracing::debug!(worker = %worker_id, "discarding stale idle slot");
                }
            }
        }
        None
    }

    /// Account for a job handed to a slot taken by [`WorkerPool::next_idle`].
    pub fn occupy(&mut self, worker_id: WorkerId) {
        let has_free_slot = self.idle.contains(&worker_id);
        if let Some(entry) = self.workers.get_mut(&worker_id) {
            entry.busy_slots += 1;
            if !has_free_slot {
                entry.state = WorkerState::Busy;
            }
        }
    }

    /// Account for a job that left `worker_id`, without offering the slot
    /// again.
    pub fn vacate(&mut self, worker_id: WorkerId) {
        if let Some(entry) = self.workers.get_mut(&worker_id) {
            entry.busy_slots = entry.busy_slots.saturating_sub(1);
        }
    }

    /// Return a slot to the idle queue after a job completed.
    pub fn release(&mut self, worker_id: WorkerId) -> bool {
        self.vacate(worker_id);
        self.mark_ready(worker_id)
    }

    /// Stop handing work to `worker_id`; it is about to exit.
    pub fn retire(&mut self, worker_id: WorkerId) {
        if let Some(entry) = self.workers.get_mut(&worker_id) {
            entry.state = WorkerState::Exiting;
        }
        self.idle.retain(|id| *id != worker_id);
    }

    pub fn retire_all(&mut self) {
        for entry in self.workers.values_mut() {
            entry.state = WorkerState::Exiting;
        }
        self.idle.clear();
    }

    /// Forget a worker whose channel closed.
    pub fn remove(&mut self, worker_id: WorkerId) -> bool {
        self.idle.retain(|id| *id != worker_id);
        self.workers.remove(&worker_id).is_some()
    }

    pub fn send(&self, worker_id: WorkerId, message: CoordinatorMessage<J>) -> Result<()> {
        match self.workers.get(&worker_id) {
            Some(entry) => entry.link.send(message),
            None => Err(CorralError::ChannelClosed(worker_id)),
        }
    }

    pub fn kill(&self, worker_id: WorkerId) {
        if let Some(entry) = self.workers.get(&worker_id) {
            entry.link.kill();
        }
    }

    pub fn kill_all(&self) {
        for entry in self.workers.values() {
            entry.link.kill();
        }
    }

    pub fn state(&self, worker_id: WorkerId) -> Option<WorkerState> {
        self.workers.get(&worker_id).map(|entry| entry.state)
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.workers.contains_key(&worker_id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers that still count towards the pool target.
    pub fn active_len(&self) -> usize {
        self.workers
            .values()
            .filter(|entry| !matches!(entry.state, WorkerState::Exiting | WorkerState::Dead))
            .count()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn idle_slots(&self) -> Vec<WorkerId> {
        self.idle.iter().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .map(|(worker_id, entry)| {
                let connected = entry.link.is_connected();
                WorkerSnapshot {
                    worker_id: *worker_id,
                    // exit not yet observed, but the channel is already gone
                    state: if connected { entry.state } else { WorkerState::Dead },
                    connected,
                    busy_slots: entry.busy_slots,
                }
            })
            .collect();
        workers.sort_by_key(|w| w.worker_id);
        workers
    }
}
