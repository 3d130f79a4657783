use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::error::{CorralError, JobError, Result};
use crate::events::{EventBus, JobEvent, JobEventPayload};
use crate::ipc::{CoordinatorMessage, WorkerMessage};
use crate::job::{
    Completion, Job, JobId, JobPayload, JobResult, JobState, JobTicket, RetryLimit, WorkerId,
};
use crate::lease::{process_expired_lease, DeadlineTimer, ExpiryOutcome, InFlightTable};
use crate::pool::WorkerPool;
use crate::queue::{JobQueue, PoolSnapshot};
use crate::telemetry;

use super::transport::{LinkEvent, LinkSink, WorkerSpawner};

/// Coordinator-side settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Live workers kept by [`Coordinator::launch`] and respawn.
    pub worker_count: usize,
    /// Deadline armed for every assignment.
    pub job_timeout_ms: u64,
    pub max_retries: RetryLimit,
    /// Buffered lifecycle events per subscriber.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            job_timeout_ms: 30_000,
            max_retries: RetryLimit::Unlimited,
            event_capacity: 1024,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_job_timeout(mut self, ms: u64) -> Self {
        self.job_timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, limit: impl Into<RetryLimit>) -> Self {
        self.max_retries = limit.into();
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

enum Command<J: JobPayload> {
    Submit {
        payload: J,
        to_front: bool,
        completion: Completion<J::Output>,
    },
    Start {
        target: usize,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle on a running coordinator.
///
/// The queue, in-flight table and worker pool live on a single tokio task;
/// every handle method is a message to that task, so all mutations are
/// serialised. Dropping the last handle shuts the coordinator down.
///
/// Retried jobs are re-submitted under a fresh [`JobId`]. Do not key
/// external state by job id across retries; hold on to the [`JobTicket`]
/// or the callback instead.
pub struct Coordinator<J: JobPayload> {
    commands: mpsc::UnboundedSender<Command<J>>,
    events: EventBus,
    config: Arc<CoordinatorConfig>,
}

impl<J: JobPayload> Clone for Coordinator<J> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            events: self.events.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<J: JobPayload> fmt::Debug for Coordinator<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("payload_type", &type_name::<J>())
            .field("config", &self.config)
            .field("run_id", &self.events.run_id())
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl<J: JobPayload> Coordinator<J> {
    /// Create a stopped coordinator. Must be called inside a tokio runtime.
    pub fn new<S>(config: CoordinatorConfig, spawner: S) -> Self
    where
        S: WorkerSpawner<J>,
    {
        let events = EventBus::new(config.event_capacity);
        Self::from_parts(config, Arc::new(spawner), events)
    }

    /// Create a coordinator and start `config.worker_count` workers.
    pub async fn launch<S>(config: CoordinatorConfig, spawner: S) -> Result<Self>
    where
        S: WorkerSpawner<J>,
    {
        let target = config.worker_count;
        let coordinator = Self::new(config, spawner);
        coordinator.start(target).await?;
        Ok(coordinator)
    }

    pub(crate) fn from_parts(
        config: CoordinatorConfig,
        spawner: Arc<dyn WorkerSpawner<J>>,
        events: EventBus,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);

        let actor = CoordinatorActor {
            config: Arc::clone(&config),
            spawner,
            events: events.clone(),
            queue: JobQueue::new(),
            in_flight: InFlightTable::new(),
            pool: WorkerPool::new(),
            running: false,
            target: 0,
            next_job_id: 0,
            next_worker_id: 0,
            commands: command_rx,
            link_tx,
            link_rx,
            deadline_tx,
            deadline_rx,
        };
        tokio::spawn(actor.run());

        Self {
            commands,
            events,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Identifies this coordinator in [`JobEvent::meta`].
    pub fn run_id(&self) -> Uuid {
        self.events.run_id()
    }

    /// Spawn `target` workers and begin dispatching.
    ///
    /// Returns `false` without doing anything if already running.
    pub async fn start(&self, target: usize) -> Result<bool> {
        self.request(|reply| Command::Start { target, reply }).await
    }

    /// Stop respawning and kill every live worker.
    ///
    /// Pending and in-flight jobs are kept: in-flight jobs move back to the
    /// queue as their workers' exits are observed, and everything is served
    /// again after the next [`Coordinator::start`]. Drain before stopping if
    /// the jobs must finish.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Queue `payload` and return a ticket for its terminal result.
    ///
    /// `to_front` puts the job ahead of everything already pending.
    pub fn submit(&self, payload: J, to_front: bool) -> JobTicket<J::Output> {
        let (tx, rx) = oneshot::channel();
        self.send_submit(payload, to_front, Completion::Channel(tx));
        JobTicket::new(rx)
    }

    /// Queue `payload` and invoke `on_done` exactly once with its terminal
    /// result.
    ///
    /// The callback runs on the coordinator task and must not block.
    pub fn submit_with<F>(&self, payload: J, to_front: bool, on_done: F)
    where
        F: FnOnce(JobResult<J::Output>) + Send + 'static,
    {
        self.send_submit(payload, to_front, Completion::Callback(Box::new(on_done)));
    }

    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stop, kill every worker and end the coordinator task.
    ///
    /// Every job still pending or in flight resolves to
    /// [`JobError::Abandoned`].
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(CorralError::CoordinatorClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn send_submit(&self, payload: J, to_front: bool, completion: Completion<J::Output>) {
        let command = Command::Submit {
            payload,
            to_front,
            completion,
        };
        if let Err(mpsc::error::SendError(Command::Submit { completion, .. })) =
            self.commands.send(command)
        {
            completion.fulfill(Err(JobError::Abandoned));
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command<J>) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| CorralError::CoordinatorClosed)?;
        rx.await.map_err(|_| CorralError::CoordinatorClosed)
    }
}

struct CoordinatorActor<J: JobPayload> {
    config: Arc<CoordinatorConfig>,
    spawner: Arc<dyn WorkerSpawner<J>>,
    events: EventBus,
    queue: JobQueue<J>,
    in_flight: InFlightTable<J>,
    pool: WorkerPool<J>,
    running: bool,
    target: usize,
    next_job_id: u64,
    next_worker_id: u64,
    commands: mpsc::UnboundedReceiver<Command<J>>,
    link_tx: mpsc::UnboundedSender<LinkEvent<J::Output>>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent<J::Output>>,
    deadline_tx: mpsc::UnboundedSender<JobId>,
    deadline_rx: mpsc::UnboundedReceiver<JobId>,
}

enum Flow {
    Continue,
    Shutdown(Option<oneshot::Sender<()>>),
}

impl<J: JobPayload> CoordinatorActor<J> {
    async fn run(mut self) {
        tracing::info!(run_id = %self.events.run_id(), "coordinator started");

        let reply = loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => Flow::Shutdown(None),
                },
                Some(event) = self.link_rx.recv() => {
                    self.handle_link_event(event);
                    Flow::Continue
                }
                Some(job_id) = self.deadline_rx.recv() => {
                    self.handle_deadline(job_id);
                    Flow::Continue
                }
            };
            if let Flow::Shutdown(reply) = flow {
                break reply;
            }
        };

        self.teardown();
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
        tracing::info!(run_id = %self.events.run_id(), "coordinator shut down");
    }

    fn handle_command(&mut self, command: Command<J>) -> Flow {
        match command {
            Command::Submit {
                payload,
                to_front,
                completion,
            } => {
                self.enqueue(payload, 0, to_front, completion);
                self.dispatch();
            }
            Command::Start { target, reply } => {
                let _ = reply.send(self.start(target));
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => return Flow::Shutdown(Some(reply)),
        }
        Flow::Continue
    }

    fn start(&mut self, target: usize) -> bool {
        if self.running {
            tracing::debug!("start ignored; coordinator already running");
            return false;
        }
        self.running = true;
        self.target = target;
        let missing = target.saturating_sub(self.pool.active_len());
        tracing::info!(target, spawning = missing, "starting worker pool");
        for _ in 0..missing {
            self.spawn_worker();
        }
        self.dispatch();
        true
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        tracing::info!(
            workers = self.pool.len(),
            pending = self.queue.len(),
            in_flight = self.in_flight.len(),
            "stopping worker pool"
        );
        self.pool.kill_all();
        self.pool.retire_all();
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            sampled_at: Utc::now(),
            running: self.running,
            pending: self.queue.ids(),
            in_flight: self.in_flight.entries(),
            idle_slots: self.pool.idle_slots(),
            workers: self.pool.snapshot(),
        }
    }

    fn teardown(&mut self) {
        self.running = false;
        self.pool.kill_all();
        self.pool.retire_all();

        let mut abandoned = 0usize;
        for lease in self.in_flight.drain() {
            lease.release().finish(Err(JobError::Abandoned));
            abandoned += 1;
        }
        for job in self.queue.drain() {
            job.finish(Err(JobError::Abandoned));
            abandoned += 1;
        }
        if abandoned > 0 {
            tracing::warn!(abandoned, "coordinator shut down with unfinished jobs");
        }
        telemetry::set_queue_depth(0, 0);
    }

    fn allocate_job_id(&mut self) -> JobId {
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;
        id
    }

    /// Place a job in the queue under a fresh id.
    fn enqueue(
        &mut self,
        payload: J,
        retries: u32,
        to_front: bool,
        completion: Completion<J::Output>,
    ) -> JobId {
        let job_id = self.allocate_job_id();
        let _span = telemetry::job_submit_span(job_id, retries).entered();
        self.queue
            .enqueue(Job::new(job_id, payload, retries, completion), to_front);
        telemetry::record_job_submitted(job_id, retries, to_front);
        self.events.publish(JobEventPayload::Enqueued {
            job_id,
            retries,
            to_front,
        });
        job_id
    }

    /// Pair idle slots with pending jobs until one side runs out.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker_id) = self.pool.next_idle() else {
                break;
            };
            let Some(job) = self.queue.dequeue() else {
                break;
            };
            self.assign(job, worker_id);
        }
        telemetry::set_queue_depth(self.queue.len(), self.in_flight.len());
    }

    fn assign(&mut self, job: Job<J>, worker_id: WorkerId) {
        let job_id = job.id;
        let retries = job.retries;
        let _span = telemetry::job_dispatch_span(job_id, worker_id).entered();
        let message = CoordinatorMessage::Assign {
            job_id,
            payload: job.payload.clone(),
        };

        self.pool.occupy(worker_id);
        let deadline = self.arm_deadline(job_id);
        self.in_flight.insert(job, worker_id, deadline);
        self.events.publish(JobEventPayload::Assigned {
            job_id,
            worker_id,
            retries,
        });

        if let Err(err) = self.pool.send(worker_id, message) {
            // the exit event will put the job back in the queue
            tracing::warn!(job_id = %job_id, worker_id = %worker_id, error = %err, "assignment not delivered");
        }
    }

    fn arm_deadline(&self, job_id: JobId) -> DeadlineTimer {
        let deadline_tx = self.deadline_tx.clone();
        DeadlineTimer::arm(self.config.job_timeout(), move || {
            let _ = deadline_tx.send(job_id);
        })
    }

    fn spawn_worker(&mut self) {
        let worker_id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        let sink = LinkSink::new(worker_id, self.link_tx.clone());
        match self.spawner.spawn(worker_id, sink) {
            Ok(link) => {
                self.pool.insert(worker_id, link);
                tracing::debug!(worker_id = %worker_id, "worker spawned");
                self.events
                    .publish(JobEventPayload::WorkerSpawned { worker_id });
            }
            Err(err) => {
                let err = CorralError::Spawn {
                    worker: worker_id,
                    reason: format!("{err:#}"),
                };
                tracing::error!(error = %err, "worker spawn failed");
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent<J::Output>) {
        match event {
            LinkEvent::Message { worker_id, message } => match message {
                WorkerMessage::Ready { .. } => self.handle_ready(worker_id),
                WorkerMessage::Complete {
                    job_id,
                    error,
                    result,
                    is_final,
                    ..
                } => self.handle_complete(worker_id, job_id, error, result, is_final),
            },
            LinkEvent::Exited { worker_id, detail } => self.handle_exit(worker_id, detail),
        }
    }

    fn handle_ready(&mut self, worker_id: WorkerId) {
        if self.pool.mark_ready(worker_id) {
            self.events
                .publish(JobEventPayload::WorkerReady { worker_id });
            self.dispatch();
        } else {
            tracing::debug!(worker_id = %worker_id, "ignoring ready from worker that takes no work");
        }
    }

    fn handle_complete(
        &mut self,
        worker_id: WorkerId,
        job_id: JobId,
        error: Option<String>,
        result: Option<J::Output>,
        is_final: bool,
    ) {
        let _span = telemetry::job_complete_span(job_id, worker_id).entered();

        match self.in_flight.remove(job_id) {
            Some(lease) => {
                if lease.worker_id != worker_id {
                    tracing::warn!(
                        job_id = %job_id,
                        assigned = %lease.worker_id,
                        "completion reported by a different worker"
                    );
                }
                let elapsed = lease.elapsed();
                let job = lease.release();
                let outcome = completion_outcome(error, result);
                match &outcome {
                    Ok(_) => {
                        telemetry::record_job_finished(job_id, "success", elapsed);
                        self.events
                            .publish(JobEventPayload::Completed { job_id, worker_id });
                    }
                    Err(err) => {
                        telemetry::record_job_finished(job_id, "executor_error", elapsed);
                        self.events.publish(JobEventPayload::Failed {
                            job_id,
                            worker_id,
                            error: err.to_string(),
                        });
                    }
                }
                job.finish(outcome);
            }
            None => {
                tracing::debug!(job_id = %job_id, "completion for a job no longer in flight");
            }
        }

        if let Err(err) = self.pool.send(worker_id, CoordinatorMessage::Ack) {
            tracing::debug!(worker_id = %worker_id, error = %err, "ack not delivered");
        }

        if is_final {
            self.pool.vacate(worker_id);
            self.retire(worker_id);
        } else {
            self.pool.release(worker_id);
        }
        self.dispatch();
    }

    fn handle_deadline(&mut self, job_id: JobId) {
        let Some(lease) = self.in_flight.remove(job_id) else {
            tracing::trace!(job_id = %job_id, "deadline for a job no longer in flight");
            return;
        };
        let worker_id = lease.worker_id;
        let elapsed = lease.elapsed();
        let mut job = lease.release();
        let _span = telemetry::job_expire_span(job_id, job.retries).entered();
        telemetry::record_job_expired(job_id, worker_id, job.retries);

        match process_expired_lease(job.retries, self.config.max_retries) {
            ExpiryOutcome::Exhausted { retries } => {
                telemetry::record_job_finished(job_id, "retries_exhausted", elapsed);
                self.events.publish(JobEventPayload::RetriesExhausted {
                    job_id,
                    worker_id,
                    retries,
                });
                job.finish(Err(JobError::RetriesExhausted { retries }));

                // the worker is presumed stuck
                self.pool.vacate(worker_id);
                if let Err(err) = self.pool.send(worker_id, CoordinatorMessage::ForceExit) {
                    tracing::debug!(worker_id = %worker_id, error = %err, "force exit not delivered");
                }
                self.retire(worker_id);
            }
            ExpiryOutcome::Retry { retries } => {
                job.state = JobState::Expired;
                tracing::debug!(job_id = %job_id, state = ?job.state, retries, "re-submitting expired job");
                self.events.publish(JobEventPayload::Expired {
                    job_id,
                    worker_id,
                    retries: job.retries,
                });
                self.enqueue(job.payload, retries, true, job.completion);
            }
        }
        self.dispatch();
    }

    fn handle_exit(&mut self, worker_id: WorkerId, detail: String) {
        let leases = self.in_flight.take_assigned_to(worker_id);
        let requeued = leases.len();
        for lease in leases {
            let job = lease.release();
            self.events.publish(JobEventPayload::Requeued {
                job_id: job.id,
                worker_id,
                retries: job.retries,
            });
            // crashes do not count against the retry budget
            self.enqueue(job.payload, job.retries, true, job.completion);
        }

        let known = self.pool.remove(worker_id);
        telemetry::record_worker_exit(worker_id, &detail, requeued);

        let respawn = known && self.running && self.pool.active_len() < self.target;
        self.events.publish(JobEventPayload::WorkerExited {
            worker_id,
            detail,
            respawned: respawn,
        });
        if respawn {
            self.spawn_worker();
        }
        self.dispatch();
    }

    fn retire(&mut self, worker_id: WorkerId) {
        if self.pool.contains(worker_id) {
            self.pool.retire(worker_id);
            self.events
                .publish(JobEventPayload::WorkerRetiring { worker_id });
        }
    }
}

/// Turn a completion report into the submitter's result.
///
/// An error wins over a result. A report with neither is a success only
/// when the output type deserializes from `null` (e.g. `()`).
fn completion_outcome<O>(error: Option<String>, result: Option<O>) -> JobResult<O>
where
    O: serde::de::DeserializeOwned,
{
    match (error, result) {
        (Some(error), _) => Err(JobError::Executor(error)),
        (None, Some(result)) => Ok(result),
        (None, None) => serde_json::from_value(serde_json::Value::Null).map_err(|_| {
            JobError::Executor("worker reported neither a result nor an error".into())
        }),
    }
}
