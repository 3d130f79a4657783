use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobId, WorkerId};

/// Metadata envelope attached to every event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Identifies the coordinator instance that emitted the event.
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            version: 1,
            run_id,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle event published by the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

/// Job and worker transitions observed by the coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job entered the pending queue.
    Enqueued {
        job_id: JobId,
        retries: u32,
        to_front: bool,
    },
    /// Job was handed to a worker and its deadline armed.
    Assigned {
        job_id: JobId,
        worker_id: WorkerId,
        retries: u32,
    },
    /// Worker reported success.
    Completed { job_id: JobId, worker_id: WorkerId },
    /// Worker reported an executor error; terminal.
    Failed {
        job_id: JobId,
        worker_id: WorkerId,
        error: String,
    },
    /// Deadline fired with retries left; the payload is re-submitted.
    Expired {
        job_id: JobId,
        worker_id: WorkerId,
        retries: u32,
    },
    /// Deadline fired at the retry limit; terminal.
    RetriesExhausted {
        job_id: JobId,
        worker_id: WorkerId,
        retries: u32,
    },
    /// Worker exited while holding the job; re-submitted at the same count.
    Requeued {
        job_id: JobId,
        worker_id: WorkerId,
        retries: u32,
    },
    WorkerSpawned { worker_id: WorkerId },
    /// One concurrency slot became available.
    WorkerReady { worker_id: WorkerId },
    /// Worker will take no more work (final job or forced exit).
    WorkerRetiring { worker_id: WorkerId },
    WorkerExited {
        worker_id: WorkerId,
        detail: String,
        respawned: bool,
    },
}

/// In-process fan-out of [`JobEvent`]s over a tokio broadcast channel.
///
/// Publishing never blocks; a subscriber that falls more than `capacity`
/// events behind receives `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
    run_id: Uuid,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("run_id", &self.run_id)
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            run_id: Uuid::now_v7(),
            capacity,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to every current subscriber; dropped silently if none.
    pub fn publish(&self, payload: JobEventPayload) {
        let _ = self.sender.send(JobEvent {
            meta: EventMeta::new(self.run_id),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(JobEventPayload::WorkerSpawned {
            worker_id: WorkerId(1),
        });

        for rx in [&mut rx1, &mut rx2] {
            let event = timeout(Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.meta.run_id, bus.run_id());
            assert_eq!(
                event.payload,
                JobEventPayload::WorkerSpawned {
                    worker_id: WorkerId(1)
                }
            );
        }
    }

    #[tokio::test]
    async fn lagged_subscriber_does_not_block_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for id in 0..5 {
            bus.publish(JobEventPayload::WorkerReady {
                worker_id: WorkerId(id),
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(JobEventPayload::WorkerReady {
            worker_id: WorkerId(0),
        });
        assert_eq!(bus.subscriber_count(), 0);
        assert!(format!("{bus:?}").contains("capacity: 4"));
    }
}
