//! Message contract between the coordinator and each worker.
//!
//! Both directions are internally tagged by a `tag` field with camelCase
//! field names, so the in-process and child-process transports share one
//! wire shape. Child processes exchange one JSON document per line.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{JobId, WorkerId};

/// Worker → coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage<O> {
    /// One concurrency slot is available.
    Ready { worker_id: WorkerId },
    /// A job finished, successfully or with an executor error.
    Complete {
        worker_id: WorkerId,
        job_id: JobId,
        error: Option<String>,
        result: Option<O>,
        /// The worker will not take more work and is about to recycle.
        is_final: bool,
    },
}

impl<O> WorkerMessage<O> {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerMessage::Ready { worker_id } => *worker_id,
            WorkerMessage::Complete { worker_id, .. } => *worker_id,
        }
    }
}

/// Coordinator → worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CoordinatorMessage<J> {
    Assign { job_id: JobId, payload: J },
    /// Acknowledges a `complete` message.
    Ack,
    /// The worker is presumed stuck and must exit now.
    ForceExit,
}

/// Serialise a message as a single JSON line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}
