use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::Instrument;

use crate::executor::{Executor, Executors, JobHandler};
use crate::ipc::{CoordinatorMessage, WorkerMessage};
use crate::job::{JobId, JobPayload, WorkerId};
use crate::telemetry;

/// Configuration for individual workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Recycle after completing this many jobs.
    pub recycle_after_jobs: u32,
    /// Recycle after this many milliseconds of lifetime, if set.
    pub recycle_after_ms: Option<u64>,
    /// Jobs held at once; one `ready` is announced per slot.
    pub concurrency: usize,
    /// How long to wait for the coordinator's `ack` of the final job.
    pub ack_timeout_ms: u64,
    /// Upper bound on each executor's teardown.
    pub teardown_timeout_ms: u64,
}

impl WorkerConfig {
    /// Set the job-count recycle threshold.
    pub fn with_recycle_after_jobs(mut self, jobs: u32) -> Self {
        self.recycle_after_jobs = jobs;
        self
    }

    /// Set or clear the lifetime recycle threshold.
    pub fn with_recycle_after(mut self, ms: Option<u64>) -> Self {
        self.recycle_after_ms = ms;
        self
    }

    /// Set the number of concurrency slots.
    pub fn with_concurrency(mut self, slots: usize) -> Self {
        self.concurrency = slots;
        self
    }

    /// Set the final-ack wait.
    pub fn with_ack_timeout(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    /// Set the per-executor teardown bound.
    pub fn with_teardown_timeout(mut self, ms: u64) -> Self {
        self.teardown_timeout_ms = ms;
        self
    }

    pub fn recycle_after(&self) -> Option<Duration> {
        self.recycle_after_ms.map(Duration::from_millis)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            recycle_after_jobs: 25,
            recycle_after_ms: None,
            concurrency: 1,
            ack_timeout_ms: 1_000,
            teardown_timeout_ms: 5_000,
        }
    }
}

/// Why a worker agent stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WorkerExit {
    /// Reached the job-count threshold.
    Recycled,
    /// Reached the lifetime threshold.
    LifetimeElapsed,
    /// The coordinator sent `forceExit`.
    ForcedExit,
    /// The coordinator side of the channel closed.
    Disconnected,
}

impl WorkerExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerExit::Recycled => "recycled",
            WorkerExit::LifetimeElapsed => "lifetime_elapsed",
            WorkerExit::ForcedExit => "forced_exit",
            WorkerExit::Disconnected => "disconnected",
        }
    }
}

/// Worker half of a channel pair.
#[derive(Debug)]
pub struct WorkerEndpoint<J: JobPayload> {
    pub worker_id: WorkerId,
    pub inbox: mpsc::UnboundedReceiver<CoordinatorMessage<J>>,
    pub outbox: mpsc::UnboundedSender<WorkerMessage<J::Output>>,
}

/// Coordinator half of a channel pair.
#[derive(Debug)]
pub struct CoordinatorEndpoint<J: JobPayload> {
    pub to_worker: mpsc::UnboundedSender<CoordinatorMessage<J>>,
    pub from_worker: mpsc::UnboundedReceiver<WorkerMessage<J::Output>>,
}

impl<J: JobPayload> WorkerEndpoint<J> {
    /// Create a connected in-memory channel pair for `worker_id`.
    pub fn pair(worker_id: WorkerId) -> (WorkerEndpoint<J>, CoordinatorEndpoint<J>) {
        let (to_worker, inbox) = mpsc::unbounded_channel();
        let (outbox, from_worker) = mpsc::unbounded_channel();
        (
            WorkerEndpoint {
                worker_id,
                inbox,
                outbox,
            },
            CoordinatorEndpoint {
                to_worker,
                from_worker,
            },
        )
    }
}

type Resources<H> = Arc<HashMap<String, Arc<dyn Executor<H>>>>;

/// Worker-side protocol: announce slots, run assigned jobs, recycle.
pub struct WorkerAgent<J: JobPayload, H> {
    config: WorkerConfig,
    executors: Executors<H>,
    handler: Arc<dyn JobHandler<J, H>>,
}

impl<J: JobPayload, H> Clone for WorkerAgent<J, H> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            executors: self.executors.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<J: JobPayload, H> std::fmt::Debug for WorkerAgent<J, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAgent")
            .field("config", &self.config)
            .field("executors", &self.executors)
            .finish()
    }
}

impl<J, H> WorkerAgent<J, H>
where
    J: JobPayload,
    H: Send + 'static,
{
    pub fn new(
        config: WorkerConfig,
        executors: Executors<H>,
        handler: Arc<dyn JobHandler<J, H>>,
    ) -> Self {
        Self {
            config,
            executors,
            handler,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Serve the coordinator over `endpoint` until the worker exits.
    ///
    /// Fails only when an executor resource cannot be created at startup.
    pub async fn run(self, endpoint: WorkerEndpoint<J>) -> anyhow::Result<WorkerExit> {
        let span = telemetry::worker_span(endpoint.worker_id);
        self.run_inner(endpoint).instrument(span).await
    }

    async fn run_inner(self, endpoint: WorkerEndpoint<J>) -> anyhow::Result<WorkerExit> {
        let WorkerEndpoint {
            worker_id,
            mut inbox,
            outbox,
        } = endpoint;

        let resources = self.create_resources().await?;
        tracing::info!(
            executors = resources.len(),
            slots = self.config.concurrency,
            "worker ready"
        );

        for _ in 0..self.config.concurrency {
            if outbox.send(WorkerMessage::Ready { worker_id }).is_err() {
                self.teardown(&resources).await;
                return Ok(WorkerExit::Disconnected);
            }
        }

        let lifetime = self.config.recycle_after();
        let expiry = async move {
            match lifetime {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        let mut running: JoinSet<(JobId, Result<J::Output, String>)> = JoinSet::new();
        let mut processed: u32 = 0;

        let exit = loop {
            tokio::select! {
                _ = &mut expiry => {
                    tracing::info!(in_flight = running.len(), "worker lifetime elapsed");
                    break WorkerExit::LifetimeElapsed;
                }
                message = inbox.recv() => match message {
                    Some(CoordinatorMessage::Assign { job_id, payload }) => {
                        tracing::debug!(job_id = %job_id, executor = payload.executor(), "job assigned");
                        running.spawn(run_job(
                            Arc::clone(&resources),
                            Arc::clone(&self.handler),
                            job_id,
                            payload,
                        ));
                    }
                    Some(CoordinatorMessage::Ack) => {
                        tracing::trace!("completion acknowledged");
                    }
                    Some(CoordinatorMessage::ForceExit) => {
                        tracing::warn!(in_flight = running.len(), "forced to exit by coordinator");
                        break WorkerExit::ForcedExit;
                    }
                    None => break WorkerExit::Disconnected,
                },
                Some(joined) = running.join_next() => {
                    let (job_id, outcome) = match joined {
                        Ok(done) => done,
                        Err(err) => {
                            tracing::error!(error = %err, "job task failed");
                            continue;
                        }
                    };
                    processed += 1;
                    let is_final = processed >= self.config.recycle_after_jobs;
                    let (error, result) = match outcome {
                        Ok(output) => (None, Some(output)),
                        Err(error) => (Some(error), None),
                    };
                    tracing::debug!(
                        job_id = %job_id,
                        failed = error.is_some(),
                        processed,
                        is_final,
                        "job finished"
                    );
                    let sent = outbox.send(WorkerMessage::Complete {
                        worker_id,
                        job_id,
                        error,
                        result,
                        is_final,
                    });
                    if sent.is_err() {
                        break WorkerExit::Disconnected;
                    }
                    if is_final {
                        self.await_final_ack(&mut inbox).await;
                        break WorkerExit::Recycled;
                    }
                }
            }
        };

        if !running.is_empty() {
            tracing::debug!(abandoned = running.len(), "abandoning in-flight jobs");
        }
        running.abort_all();
        self.teardown(&resources).await;
        tracing::info!(reason = exit.as_str(), processed, "worker exiting");
        Ok(exit)
    }

    async fn create_resources(&self) -> anyhow::Result<Resources<H>> {
        let mut resources: HashMap<String, Arc<dyn Executor<H>>> = HashMap::new();
        for (name, factory) in self.executors.iter() {
            match factory.create().await {
                Ok(resource) => {
                    resources.insert(name.clone(), Arc::from(resource));
                }
                Err(err) => {
                    let created = Arc::new(resources);
                    self.teardown(&created).await;
                    return Err(err).with_context(|| format!("creating executor `{name}`"));
                }
            }
        }
        Ok(Arc::new(resources))
    }

    async fn await_final_ack(&self, inbox: &mut mpsc::UnboundedReceiver<CoordinatorMessage<J>>) {
        let wait = async {
            while let Some(message) = inbox.recv().await {
                match message {
                    CoordinatorMessage::Ack | CoordinatorMessage::ForceExit => return,
                    CoordinatorMessage::Assign { job_id, .. } => {
                        tracing::debug!(job_id = %job_id, "ignoring assignment while recycling");
                    }
                }
            }
        };
        let limit = Duration::from_millis(self.config.ack_timeout_ms);
        if tokio::time::timeout(limit, wait).await.is_err() {
            tracing::warn!("no ack for final job, recycling anyway");
        }
    }

    /// Ask every resource to exit and wait for all of them, each bounded by
    /// the teardown timeout.
    async fn teardown(&self, resources: &Resources<H>) {
        let limit = Duration::from_millis(self.config.teardown_timeout_ms);
        let mut exits = JoinSet::new();
        for (name, resource) in resources.iter() {
            let name = name.clone();
            let resource = Arc::clone(resource);
            exits.spawn(async move {
                match tokio::time::timeout(limit, resource.exit()).await {
                    Ok(Ok(())) => tracing::debug!(executor = %name, "executor exited"),
                    Ok(Err(err)) => {
                        tracing::warn!(executor = %name, error = %err, "executor exit failed")
                    }
                    Err(_) => tracing::warn!(executor = %name, "executor exit timed out"),
                }
            });
        }
        while exits.join_next().await.is_some() {}
    }
}

/// Aborts the wrapped task when dropped, so abandoning a job also stops the
/// handler running it.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_job<J, H>(
    resources: Resources<H>,
    handler: Arc<dyn JobHandler<J, H>>,
    job_id: JobId,
    payload: J,
) -> (JobId, Result<J::Output, String>)
where
    J: JobPayload,
    H: Send + 'static,
{
    let kind = payload.executor().to_string();
    let Some(executor) = resources.get(&kind).cloned() else {
        tracing::warn!(job_id = %job_id, executor = %kind, "no such executor");
        return (job_id, Err(format!("unknown executor `{kind}`")));
    };

    let mut unit = match executor.create_unit().await {
        Ok(unit) => unit,
        Err(err) => {
            return (
                job_id,
                Err(format!("executor `{kind}` could not create a work unit: {err:#}")),
            );
        }
    };

    let task = tokio::spawn(async move {
        let outcome = handler.handle(&mut unit, payload).await;
        (unit, outcome)
    });
    let _guard = AbortOnDrop(task.abort_handle());

    match task.await {
        Ok((unit, outcome)) => {
            executor.release_unit(unit).await;
            (job_id, outcome)
        }
        Err(err) => (job_id, Err(format!("job handler failed: {err}"))),
    }
}
