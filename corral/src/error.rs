use thiserror::Error;

use crate::job::WorkerId;

/// Terminal failure delivered to a job's submitter.
///
/// Expiry with retries left and worker crashes are recovered internally and
/// never show up here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job timed out and exhausted its retry budget after {retries} retries")]
    RetriesExhausted { retries: u32 },

    #[error("executor error: {0}")]
    Executor(String),

    #[error("job abandoned: coordinator shut down before it finished")]
    Abandoned,
}

/// Errors raised by the coordinator, transports and configuration.
#[derive(Error, Debug)]
pub enum CorralError {
    #[error("coordinator is no longer running")]
    CoordinatorClosed,

    #[error("failed to spawn {worker}: {reason}")]
    Spawn { worker: WorkerId, reason: String },

    #[error("channel to {0} is closed")]
    ChannelClosed(WorkerId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CorralError>;
