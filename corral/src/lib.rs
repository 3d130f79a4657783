//! Corral - master/worker job dispatch.
//!
//! A coordinator hands discrete jobs to a fixed-size pool of workers, tracks
//! every assignment under a deadline, retries expired jobs up to a limit,
//! recovers jobs from crashed workers and keeps the pool at its target size.
//! Workers recycle themselves after a number of jobs or a lifetime, which
//! bounds resource growth in long-running executors.
//!
//! # Core Concepts
//!
//! - **Job**: application payloads implement [`JobPayload`], naming the
//!   executor that should run them. Each submission resolves exactly once,
//!   through a [`JobTicket`] or a callback.
//!
//! - **Coordinator**: [`Coordinator`] owns the [`JobQueue`], the
//!   [`InFlightTable`] and the [`WorkerPool`] on a single task and runs the
//!   dispatch loop.
//!
//! - **Worker agent**: [`WorkerAgent`] drives the [`Executors`] supplied by
//!   the application and speaks the [`ipc`] protocol with the coordinator.
//!
//! - **Transports**: [`TaskSpawner`] runs agents as tokio tasks;
//!   [`ProcessSpawner`] runs them as child processes exchanging JSON lines.
//!
//! - **Events**: lifecycle transitions are published on an [`EventBus`].
//!
//! # Retries
//!
//! Only a deadline expiry counts against `max_retries`. A job whose worker
//! exits is re-queued at the front with the same retry count, so a worker
//! that keeps crashing can hold a job in the queue indefinitely.
//!
//! Every re-submission gets a fresh [`JobId`]. Do not key external state by
//! job id across retries.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use corral::*;
//!
//! let agent = WorkerAgent::new(config.worker(), executors, Arc::new(MyHandler));
//! let coordinator = Coordinator::launch(config.coordinator(), TaskSpawner::new(agent)).await?;
//! let output = coordinator.submit(MyJob::Render { url }, false).await?;
//! ```

/// Configuration surface shared by coordinator and workers.
pub mod config;

/// Error types.
///
/// [`JobError`] reaches submitters; [`CorralError`] covers the coordinator,
/// transports and configuration.
pub mod error;

/// Lifecycle events and the in-process [`EventBus`].
pub mod events;

/// Executor capabilities supplied by the embedding application.
pub mod executor;

/// Wire messages between coordinator and workers.
pub mod ipc;

/// Job, identifiers, completion and retry limit.
pub mod job;

/// In-flight table and deadline timers.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Idle-slot bookkeeping for live workers.
pub mod pool;

/// Pending job queue and pool snapshots.
pub mod queue;

/// Coordinator actor, worker agent and transports.
pub mod runtime;

/// Tracing spans and record helpers.
pub mod telemetry;

pub use config::*;
pub use error::{CorralError, JobError};
pub use events::*;
pub use executor::*;
pub use job::*;
pub use lease::*;
pub use pool::*;
pub use queue::*;
pub use runtime::*;
