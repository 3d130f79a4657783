//! Child-process side of the [`ProcessSpawner`](super::process::ProcessSpawner)
//! protocol.

use std::io::BufRead;

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::ipc::{self, CoordinatorMessage, WorkerMessage};
use crate::job::{JobPayload, WorkerId};

use super::process::WORKER_ID_ENV;
use super::worker::{WorkerAgent, WorkerEndpoint, WorkerExit};

/// Read this process's worker id from the environment.
pub fn worker_id_from_env() -> anyhow::Result<WorkerId> {
    let raw = std::env::var(WORKER_ID_ENV)
        .with_context(|| format!("{WORKER_ID_ENV} is not set; not launched as a worker"))?;
    let id = raw
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{WORKER_ID_ENV}={raw:?} is not a worker id"))?;
    Ok(WorkerId(id))
}

/// True when the current process was launched by a `ProcessSpawner`.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ID_ENV).is_some()
}

/// Run `agent` against the coordinator on stdin/stdout until it exits.
///
/// Returns once every outgoing message has been flushed. The caller should
/// return from `main` (or exit) right away; the coordinator treats the
/// process exit as the end of the worker.
pub async fn serve<J, H>(agent: WorkerAgent<J, H>) -> anyhow::Result<WorkerExit>
where
    J: JobPayload,
    H: Send + 'static,
{
    let worker_id = worker_id_from_env()?;
    let (endpoint, coordinator) = WorkerEndpoint::pair(worker_id);
    let to_agent = coordinator.to_worker;
    let mut from_agent = coordinator.from_worker;

    // A blocked stdin read cannot be cancelled, so it lives on its own
    // thread; the process exits without waiting for it.
    std::thread::Builder::new()
        .name(format!("corral-stdin-{worker_id}"))
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!(error = %err, "stdin failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match ipc::decode_line::<CoordinatorMessage<J>>(&line) {
                    Ok(message) => {
                        if to_agent.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping malformed coordinator message");
                    }
                }
            }
        })
        .context("starting stdin reader")?;

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = from_agent.recv().await {
            let line = ipc::encode_line::<WorkerMessage<J::Output>>(&message)?;
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let exit = agent.run(endpoint).await;
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "stdout failed"),
        Err(err) => tracing::warn!(error = %err, "stdout writer failed"),
    }
    exit
}

