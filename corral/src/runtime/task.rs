use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::{CorralError, Result};
use crate::ipc::CoordinatorMessage;
use crate::job::{JobPayload, WorkerId};

use super::transport::{LinkSink, WorkerLink, WorkerSpawner};
use super::worker::{WorkerAgent, WorkerEndpoint};

/// Runs each worker agent as a tokio task in the coordinator's process.
///
/// Channel semantics match the child-process transport: the end of the task
/// is reported as a worker exit, and `kill` aborts it.
pub struct TaskSpawner<J: JobPayload, H> {
    agent: WorkerAgent<J, H>,
}

impl<J: JobPayload, H> std::fmt::Debug for TaskSpawner<J, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpawner").field("agent", &self.agent).finish()
    }
}

impl<J: JobPayload, H: Send + 'static> TaskSpawner<J, H> {
    pub fn new(agent: WorkerAgent<J, H>) -> Self {
        Self { agent }
    }
}

impl<J, H> WorkerSpawner<J> for TaskSpawner<J, H>
where
    J: JobPayload,
    H: Send + 'static,
{
    fn spawn(
        &self,
        worker_id: WorkerId,
        sink: LinkSink<J::Output>,
    ) -> anyhow::Result<Box<dyn WorkerLink<J>>> {
        let (endpoint, coordinator) = WorkerEndpoint::pair(worker_id);
        let mut from_worker = coordinator.from_worker;
        let connected = Arc::new(AtomicBool::new(true));

        let agent = self.agent.clone();
        let agent_task = tokio::spawn(agent.run(endpoint));
        let agent_abort = agent_task.abort_handle();

        let link_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            // drains until the agent drops its outbox, so every message is
            // delivered before the exit
            while let Some(message) = from_worker.recv().await {
                sink.deliver(message);
            }
            link_connected.store(false, Ordering::SeqCst);
            let detail = match agent_task.await {
                Ok(Ok(exit)) => exit.as_str().to_string(),
                Ok(Err(err)) => format!("startup failed: {err:#}"),
                Err(err) if err.is_cancelled() => "killed".to_string(),
                Err(err) => format!("panicked: {err}"),
            };
            sink.closed(detail);
        });

        Ok(Box::new(TaskLink {
            worker_id,
            to_worker: coordinator.to_worker,
            connected,
            agent: agent_abort,
        }))
    }
}

struct TaskLink<J: JobPayload> {
    worker_id: WorkerId,
    to_worker: mpsc::UnboundedSender<CoordinatorMessage<J>>,
    connected: Arc<AtomicBool>,
    agent: AbortHandle,
}

impl<J: JobPayload> WorkerLink<J> for TaskLink<J> {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn send(&self, message: CoordinatorMessage<J>) -> Result<()> {
        self.to_worker
            .send(message)
            .map_err(|_| CorralError::ChannelClosed(self.worker_id))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.to_worker.is_closed()
    }

    fn kill(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.agent.abort();
    }
}
