use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corral::error::Result;
use corral::ipc::{CoordinatorMessage, WorkerMessage};
use corral::{CorralError, JobId, LinkSink, WorkerId, WorkerLink, WorkerSpawner};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::TestJob;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawner whose workers are driven by the test itself.
///
/// Every spawned worker is handed out through [`ScriptedWorkers::next`]; the
/// test then plays the worker side of the protocol.
#[derive(Clone)]
pub struct ScriptedSpawner {
    spawned: mpsc::UnboundedSender<ScriptedWorker>,
    ids: Arc<Mutex<Vec<WorkerId>>>,
    fail: Arc<AtomicBool>,
}

/// Receiving end of a [`ScriptedSpawner`].
pub struct ScriptedWorkers {
    spawned: mpsc::UnboundedReceiver<ScriptedWorker>,
    ids: Arc<Mutex<Vec<WorkerId>>>,
    fail: Arc<AtomicBool>,
}

impl ScriptedSpawner {
    pub fn new() -> (Self, ScriptedWorkers) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        (
            Self {
                spawned: tx,
                ids: Arc::clone(&ids),
                fail: Arc::clone(&fail),
            },
            ScriptedWorkers {
                spawned: rx,
                ids,
                fail,
            },
        )
    }
}

impl WorkerSpawner<TestJob> for ScriptedSpawner {
    fn spawn(
        &self,
        worker_id: WorkerId,
        sink: LinkSink<String>,
    ) -> anyhow::Result<Box<dyn WorkerLink<TestJob>>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("scripted spawn failure");
        }
        let (to_worker, inbox) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let exited = Arc::new(AtomicBool::new(false));

        self.ids.lock().push(worker_id);
        let _ = self.spawned.send(ScriptedWorker {
            worker_id,
            sink: sink.clone(),
            inbox,
            connected: Arc::clone(&connected),
            exited: Arc::clone(&exited),
        });

        Ok(Box::new(ScriptedLink {
            worker_id,
            sink,
            to_worker,
            connected,
            exited,
        }))
    }
}

impl ScriptedWorkers {
    /// Wait for the next spawned worker.
    pub async fn next(&mut self) -> ScriptedWorker {
        timeout(RECV_TIMEOUT, self.spawned.recv())
            .await
            .expect("timed out waiting for a worker to be spawned")
            .expect("spawner dropped")
    }

    /// Worker spawned since the last call, if any.
    pub fn try_next(&mut self) -> Option<ScriptedWorker> {
        self.spawned.try_recv().ok()
    }

    /// Ids of every worker spawned so far, in spawn order.
    pub fn spawned_ids(&self) -> Vec<WorkerId> {
        self.ids.lock().clone()
    }

    /// Make subsequent spawns fail.
    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

/// Test-side end of one scripted worker's channel.
pub struct ScriptedWorker {
    worker_id: WorkerId,
    sink: LinkSink<String>,
    inbox: mpsc::UnboundedReceiver<CoordinatorMessage<TestJob>>,
    connected: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
}

impl ScriptedWorker {
    pub fn id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn ready(&self) {
        self.sink.deliver(WorkerMessage::Ready {
            worker_id: self.worker_id,
        });
    }

    pub fn complete(&self, job_id: JobId, outcome: std::result::Result<&str, &str>, is_final: bool) {
        let (error, result) = match outcome {
            Ok(result) => (None, Some(result.to_string())),
            Err(error) => (Some(error.to_string()), None),
        };
        self.sink.deliver(WorkerMessage::Complete {
            worker_id: self.worker_id,
            job_id,
            error,
            result,
            is_final,
        });
    }

    /// Report the channel closed, as a crash or recycle would.
    pub fn exit(&self, detail: &str) {
        self.connected.store(false, Ordering::SeqCst);
        if !self.exited.swap(true, Ordering::SeqCst) {
            self.sink.closed(detail);
        }
    }

    /// Mark the channel as tearing down without reporting an exit yet.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn was_killed(&self) -> bool {
        self.exited.load(Ordering::SeqCst) && !self.connected.load(Ordering::SeqCst)
    }

    /// Next message from the coordinator.
    pub async fn recv(&mut self) -> CoordinatorMessage<TestJob> {
        timeout(RECV_TIMEOUT, self.inbox.recv())
            .await
            .expect("timed out waiting for a coordinator message")
            .expect("coordinator dropped the link")
    }

    /// Next message, if one arrives within `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<CoordinatorMessage<TestJob>> {
        timeout(wait, self.inbox.recv()).await.ok().flatten()
    }

    /// Next message, which must be an assignment.
    pub async fn expect_assign(&mut self) -> (JobId, TestJob) {
        match self.recv().await {
            CoordinatorMessage::Assign { job_id, payload } => (job_id, payload),
            other => panic!("expected an assignment, got {other:?}"),
        }
    }

    /// Next message, which must be an ack.
    pub async fn expect_ack(&mut self) {
        match self.recv().await {
            CoordinatorMessage::Ack => {}
            other => panic!("expected an ack, got {other:?}"),
        }
    }

    /// Next message, which must be a forced exit.
    pub async fn expect_force_exit(&mut self) {
        match self.recv().await {
            CoordinatorMessage::ForceExit => {}
            other => panic!("expected forceExit, got {other:?}"),
        }
    }
}

struct ScriptedLink {
    worker_id: WorkerId,
    sink: LinkSink<String>,
    to_worker: mpsc::UnboundedSender<CoordinatorMessage<TestJob>>,
    connected: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
}

impl WorkerLink<TestJob> for ScriptedLink {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn send(&self, message: CoordinatorMessage<TestJob>) -> Result<()> {
        self.to_worker
            .send(message)
            .map_err(|_| CorralError::ChannelClosed(self.worker_id))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Killing a scripted worker reports its exit right away.
    fn kill(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if !self.exited.swap(true, Ordering::SeqCst) {
            self.sink.closed("killed");
        }
    }
}
