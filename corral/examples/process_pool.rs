//! Child-process worker pool.
//!
//! The example binary is both the coordinator and the worker: the
//! coordinator re-launches its own executable, and a copy started by
//! `ProcessSpawner` detects that through the environment and serves jobs
//! over stdin/stdout instead.
//!
//! Run with `cargo run --example process_pool`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral::runtime::stdio;
use corral::*;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum HashJob {
    /// FNV-1a digest of `text`, after `delay_ms` of simulated work.
    Digest { text: String, delay_ms: u64 },
    /// Terminate the worker process mid-job.
    Crash,
}

impl JobPayload for HashJob {
    type Output = String;

    fn executor(&self) -> &str {
        "hash"
    }
}

struct HasherFactory;

#[async_trait]
impl ExecutorFactory<u64> for HasherFactory {
    async fn create(&self) -> anyhow::Result<Box<dyn Executor<u64>>> {
        Ok(Box::new(Hasher))
    }
}

/// Units are FNV offset bases.
struct Hasher;

#[async_trait]
impl Executor<u64> for Hasher {
    async fn create_unit(&self) -> anyhow::Result<u64> {
        Ok(0xcbf2_9ce4_8422_2325)
    }

    async fn release_unit(&self, _unit: u64) {}

    async fn exit(&self) -> anyhow::Result<()> {
        tracing::debug!(pid = std::process::id(), "hasher released");
        Ok(())
    }
}

struct HashHandler;

#[async_trait]
impl JobHandler<HashJob, u64> for HashHandler {
    async fn handle(&self, unit: &mut u64, payload: HashJob) -> Result<String, String> {
        match payload {
            HashJob::Digest { text, delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                for byte in text.bytes() {
                    *unit ^= u64::from(byte);
                    *unit = unit.wrapping_mul(0x0100_0000_01b3);
                }
                Ok(format!("{:016x} (pid {})", unit, std::process::id()))
            }
            HashJob::Crash => std::process::exit(101),
        }
    }
}

fn worker_agent(config: &CorralConfig) -> WorkerAgent<HashJob, u64> {
    let executors = Executors::<u64>::new().with("hash", Arc::new(HasherFactory));
    WorkerAgent::new(config.worker(), executors, Arc::new(HashHandler))
}

fn load_config() -> anyhow::Result<CorralConfig> {
    Ok(CorralConfig::from_json_str(
        r#"{
            "workerCount": 3,
            "jobTimeoutMs": 2000,
            "maxRetries": 2,
            "workerRecycleAfterJobs": 4
        }"#,
    )?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol in workers, so logs always go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "corral=info".into()))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;

    if stdio::is_worker_process() {
        let exit = stdio::serve(worker_agent(&config)).await?;
        tracing::info!(reason = exit.as_str(), "worker process done");
        return Ok(());
    }

    let coordinator = CoordinatorBuilder::from_config(&config)
        .with_spawner(ProcessSpawner::<HashJob>::new(std::env::current_exe()?))
        .build()?;

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let JobEventPayload::WorkerExited {
                worker_id,
                detail,
                respawned,
            } = event.payload
            {
                println!("[POOL] {worker_id} exited ({detail}), respawned: {respawned}");
            }
        }
    });

    coordinator.start(config.worker_count).await?;

    let mut tickets = Vec::new();
    for i in 0..12u64 {
        let job = HashJob::Digest {
            text: format!("document-{i}"),
            delay_ms: 20 * (i % 4),
        };
        tickets.push((i, coordinator.submit(job, false)));
    }
    // crashes do not use up retries, so this job takes down a worker on
    // every attempt until shutdown abandons it
    let crash = coordinator.submit(HashJob::Crash, false);

    for (i, ticket) in tickets {
        match ticket.await {
            Ok(digest) => println!("[RESULT] document-{i}: {digest}"),
            Err(err) => println!("[RESULT] document-{i} failed: {err}"),
        }
    }

    let snapshot = coordinator.snapshot().await?;
    println!(
        "[POOL] live workers: {}, pending: {}, in flight: {}",
        snapshot.live_workers(),
        snapshot.pending_count(),
        snapshot.in_flight_count()
    );

    coordinator.shutdown().await?;
    println!("[RESULT] crash job: {:?}", crash.await);
    Ok(())
}
