//! Workers as child processes speaking newline-delimited JSON on stdio.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::marker::PhantomData;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CorralError, Result};
use crate::ipc::{self, CoordinatorMessage, WorkerMessage};
use crate::job::{JobPayload, WorkerId};

use super::transport::{LinkSink, WorkerLink, WorkerSpawner};

/// Environment variable carrying the worker id into the child process.
pub const WORKER_ID_ENV: &str = "CORRAL_WORKER_ID";

/// Launches each worker as a child process.
///
/// The child is expected to run [`crate::runtime::stdio::serve`]. Its stderr is
/// inherited; stdin and stdout carry the protocol.
#[derive(Clone, Debug)]
pub struct ProcessSpawner<J> {
    program: OsString,
    args: Vec<OsString>,
    envs: BTreeMap<OsString, OsString>,
    _payload: PhantomData<fn() -> J>,
}

impl<J> ProcessSpawner<J> {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: BTreeMap::new(),
            _payload: PhantomData,
        }
    }

    /// Add a command-line argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for every child.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }
}

impl<J: JobPayload> WorkerSpawner<J> for ProcessSpawner<J> {
    fn spawn(
        &self,
        worker_id: WorkerId,
        sink: LinkSink<J::Output>,
    ) -> anyhow::Result<Box<dyn WorkerLink<J>>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.envs)
            .env(WORKER_ID_ENV, worker_id.0.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("launching {:?}", self.program))?;

        let mut stdin = child.stdin.take().context("child stdin not captured")?;
        let stdout = child.stdout.take().context("child stdout not captured")?;
        let pid = child.id();
        tracing::debug!(worker = %worker_id, pid, "worker process launched");

        let connected = Arc::new(AtomicBool::new(true));
        let (to_worker, mut outgoing) = mpsc::unbounded_channel::<CoordinatorMessage<J>>();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let writer_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                let line = match ipc::encode_line(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::error!(worker = %worker_id, error = %err, "cannot encode message");
                        continue;
                    }
                };
                if let Err(err) = stdin.write_all(line.as_bytes()).await {
                    tracing::debug!(worker = %worker_id, error = %err, "worker stdin closed");
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
                if stdin.flush().await.is_err() {
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut killed = false;
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.trim().is_empty() => {}
                        Ok(Some(line)) => match ipc::decode_line::<WorkerMessage<J::Output>>(&line) {
                            Ok(message) => sink.deliver(message),
                            Err(err) => {
                                tracing::warn!(worker = %worker_id, error = %err, "dropping malformed worker message");
                            }
                        },
                        Ok(None) => break,
                        Err(err) => {
                            tracing::warn!(worker = %worker_id, error = %err, "worker stdout failed");
                            break;
                        }
                    },
                    _ = &mut kill_rx, if !killed => {
                        killed = true;
                        reader_connected.store(false, Ordering::SeqCst);
                        if let Err(err) = child.start_kill() {
                            tracing::debug!(worker = %worker_id, error = %err, "kill failed");
                        }
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            let detail = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(err) => format!("wait failed: {err}"),
            };
            sink.closed(detail);
        });

        Ok(Box::new(ProcessLink {
            worker_id,
            to_worker,
            connected,
            kill: Mutex::new(Some(kill_tx)),
        }))
    }
}

struct ProcessLink<J> {
    worker_id: WorkerId,
    to_worker: mpsc::UnboundedSender<CoordinatorMessage<J>>,
    connected: Arc<AtomicBool>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl<J: JobPayload> WorkerLink<J> for ProcessLink<J> {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn send(&self, message: CoordinatorMessage<J>) -> Result<()> {
        self.to_worker
            .send(message)
            .map_err(|_| CorralError::ChannelClosed(self.worker_id))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kill(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }
    }
}
