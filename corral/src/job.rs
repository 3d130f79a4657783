use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::error::JobError;

/// Application data describing one unit of work.
///
/// The coordinator treats payloads as opaque; only the worker agent looks at
/// [`JobPayload::executor`] to pick the pluggable executor that runs the job.
pub trait JobPayload:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Value produced by a successful job.
    type Output: Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + std::fmt::Debug
        + 'static;

    /// Name of the executor kind that must run this job.
    fn executor(&self) -> &str;
}

/// Identifier assigned to a job at enqueue time.
///
/// Ids grow monotonically for the lifetime of a coordinator. A retried job is
/// re-submitted under a *fresh* id, so ids are not stable across retries.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Identifier of a worker, unique while the coordinator lives.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle of a job inside the coordinator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Assigned,
    Completed,
    Expired,
    PermanentlyFailed,
}

/// How many times an expired job may be retried.
///
/// Serialised as a signed integer: any negative value (canonically `-1`)
/// means unlimited.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum RetryLimit {
    #[default]
    Unlimited,
    Limited(u32),
}

impl RetryLimit {
    /// True when a job that has already been retried `retries` times must not
    /// be retried again.
    ///
    /// Equality, not `>=`: an unlimited limit never matches.
    pub fn is_exhausted(&self, retries: u32) -> bool {
        match self {
            RetryLimit::Unlimited => false,
            RetryLimit::Limited(limit) => retries == *limit,
        }
    }
}

impl From<i64> for RetryLimit {
    fn from(value: i64) -> Self {
        if value < 0 {
            RetryLimit::Unlimited
        } else {
            RetryLimit::Limited(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }
}

impl From<RetryLimit> for i64 {
    fn from(value: RetryLimit) -> Self {
        match value {
            RetryLimit::Unlimited => -1,
            RetryLimit::Limited(limit) => i64::from(limit),
        }
    }
}

/// Outcome delivered to whoever submitted a job.
pub type JobResult<O> = Result<O, JobError>;

/// Single-shot delivery of a job's terminal result.
///
/// Fulfilling consumes the value, so a job can be completed at most once.
pub enum Completion<O> {
    Channel(oneshot::Sender<JobResult<O>>),
    Callback(Box<dyn FnOnce(JobResult<O>) + Send>),
}

impl<O> Completion<O> {
    pub fn fulfill(self, result: JobResult<O>) {
        match self {
            Completion::Channel(tx) => {
                // submitter dropped its ticket
                let _ = tx.send(result);
            }
            Completion::Callback(callback) => callback(result),
        }
    }
}

impl<O> std::fmt::Debug for Completion<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Channel(_) => f.write_str("Completion::Channel"),
            Completion::Callback(_) => f.write_str("Completion::Callback"),
        }
    }
}

/// A job as held by the coordinator's queue and in-flight table.
#[derive(Debug)]
pub struct Job<J: JobPayload> {
    pub id: JobId,
    pub payload: J,
    /// Attempts already made before this one.
    pub retries: u32,
    pub state: JobState,
    /// Worker currently processing the job; `None` while pending.
    pub assigned_worker: Option<WorkerId>,
    pub completion: Completion<J::Output>,
}

impl<J: JobPayload> Job<J> {
    pub fn new(
        id: JobId,
        payload: J,
        retries: u32,
        completion: Completion<J::Output>,
    ) -> Self {
        Self {
            id,
            payload,
            retries,
            state: JobState::Pending,
            assigned_worker: None,
            completion,
        }
    }

    /// Deliver the terminal result, consuming the job.
    pub fn finish(mut self, result: JobResult<J::Output>) {
        self.state = match result {
            Ok(_) => JobState::Completed,
            Err(_) => JobState::PermanentlyFailed,
        };
        tracing::trace!(job_id = %self.id, state = ?self.state, retries = self.retries, "job finished");
        self.completion.fulfill(result);
    }
}

/// Future returned by [`crate::Coordinator::submit`], resolving once the job
/// reaches a terminal state.
#[derive(Debug)]
pub struct JobTicket<O> {
    rx: oneshot::Receiver<JobResult<O>>,
}

impl<O> JobTicket<O> {
    pub(crate) fn new(rx: oneshot::Receiver<JobResult<O>>) -> Self {
        Self { rx }
    }
}

impl<O> Future for JobTicket<O> {
    type Output = JobResult<O>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::Abandoned)))
    }
}
