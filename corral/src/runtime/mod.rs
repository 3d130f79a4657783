/// Builder for coordinators with explicit dependencies.
pub mod builder;
/// The coordinator actor and its handle.
pub mod coordinator;
/// Workers as child processes.
pub mod process;
/// Child-process side of the stdio protocol.
pub mod stdio;
/// Workers as in-process tokio tasks.
pub mod task;
/// Seams between the coordinator and worker channels.
pub mod transport;
/// The worker agent.
pub mod worker;

pub use builder::CoordinatorBuilder;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use process::{ProcessSpawner, WORKER_ID_ENV};
pub use task::TaskSpawner;
pub use transport::{LinkEvent, LinkSink, WorkerLink, WorkerSpawner};
pub use worker::{CoordinatorEndpoint, WorkerAgent, WorkerConfig, WorkerEndpoint, WorkerExit};
