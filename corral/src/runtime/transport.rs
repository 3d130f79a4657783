use tokio::sync::mpsc;

use crate::error::Result;
use crate::ipc::{CoordinatorMessage, WorkerMessage};
use crate::job::{JobPayload, WorkerId};

/// Something a transport observed on a worker's channel.
#[derive(Debug)]
pub enum LinkEvent<O> {
    Message {
        worker_id: WorkerId,
        message: WorkerMessage<O>,
    },
    /// The worker's channel closed: crash, recycle or kill.
    Exited { worker_id: WorkerId, detail: String },
}

/// Where a transport reports one worker's messages and exit.
///
/// Every message must be delivered before the exit of the same worker.
#[derive(Debug)]
pub struct LinkSink<O> {
    worker_id: WorkerId,
    tx: mpsc::UnboundedSender<LinkEvent<O>>,
}

impl<O> Clone for LinkSink<O> {
    fn clone(&self) -> Self {
        Self {
            worker_id: self.worker_id,
            tx: self.tx.clone(),
        }
    }
}

impl<O> LinkSink<O> {
    pub fn new(worker_id: WorkerId, tx: mpsc::UnboundedSender<LinkEvent<O>>) -> Self {
        Self { worker_id, tx }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Forward a message from the worker.
    ///
    /// The message's own `workerId` is replaced by the channel's identity.
    pub fn deliver(&self, message: WorkerMessage<O>) {
        let message = match message {
            WorkerMessage::Ready { .. } => WorkerMessage::Ready {
                worker_id: self.worker_id,
            },
            WorkerMessage::Complete {
                job_id,
                error,
                result,
                is_final,
                ..
            } => WorkerMessage::Complete {
                worker_id: self.worker_id,
                job_id,
                error,
                result,
                is_final,
            },
        };
        // coordinator gone; nothing left to report to
        let _ = self.tx.send(LinkEvent::Message {
            worker_id: self.worker_id,
            message,
        });
    }

    pub fn closed(&self, detail: impl Into<String>) {
        let _ = self.tx.send(LinkEvent::Exited {
            worker_id: self.worker_id,
            detail: detail.into(),
        });
    }
}

/// Coordinator-side handle on one worker's channel.
pub trait WorkerLink<J: JobPayload>: Send + Sync {
    fn worker_id(&self) -> WorkerId;

    /// Queue a message for the worker.
    fn send(&self, message: CoordinatorMessage<J>) -> Result<()>;

    /// False once the channel is closed or tearing down.
    fn is_connected(&self) -> bool;

    /// Terminate the worker. Its exit is still reported through the sink.
    fn kill(&self);
}

/// Starts workers for the coordinator.
pub trait WorkerSpawner<J: JobPayload>: Send + Sync + 'static {
    /// Start a worker identified by `worker_id` and wire its channel to
    /// `sink`.
    fn spawn(
        &self,
        worker_id: WorkerId,
        sink: LinkSink<J::Output>,
    ) -> anyhow::Result<Box<dyn WorkerLink<J>>>;
}
