//! In-process worker pool.
//!
//! Workers run as tokio tasks next to the coordinator. One job stalls on
//! purpose to show deadline expiry, retry and the forced exit of the stuck
//! worker.
//!
//! Run with `RUST_LOG=corral=debug cargo run --example in_process_pool`.

use std::sync::Arc;

use async_trait::async_trait;
use corral::*;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum TextJob {
    WordCount { text: String },
    Shout { text: String },
    Stall,
}

impl JobPayload for TextJob {
    type Output = String;

    fn executor(&self) -> &str {
        "text"
    }
}

/// Hands out reusable scratch buffers.
struct ScratchFactory;

#[async_trait]
impl ExecutorFactory<String> for ScratchFactory {
    async fn create(&self) -> anyhow::Result<Box<dyn Executor<String>>> {
        Ok(Box::new(Scratch))
    }
}

struct Scratch;

#[async_trait]
impl Executor<String> for Scratch {
    async fn create_unit(&self) -> anyhow::Result<String> {
        Ok(String::with_capacity(256))
    }

    async fn release_unit(&self, _unit: String) {}

    async fn exit(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct TextHandler;

#[async_trait]
impl JobHandler<TextJob, String> for TextHandler {
    async fn handle(&self, unit: &mut String, payload: TextJob) -> Result<String, String> {
        match payload {
            TextJob::WordCount { text } => Ok(text.split_whitespace().count().to_string()),
            TextJob::Shout { text } => {
                unit.clear();
                unit.push_str(&text.to_uppercase());
                Ok(unit.clone())
            }
            TextJob::Stall => std::future::pending().await,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "corral=info".into()))
        .init();

    let config = CorralConfig::from_json_str(
        r#"{
            "workerCount": 2,
            "jobTimeoutMs": 300,
            "maxRetries": 1,
            "workerRecycleAfterJobs": 3
        }"#,
    )?;

    let executors = Executors::<String>::new().with("text", Arc::new(ScratchFactory));
    let agent: WorkerAgent<TextJob, String> =
        WorkerAgent::new(config.worker(), executors, Arc::new(TextHandler));
    let coordinator = CoordinatorBuilder::from_config(&config)
        .with_spawner(TaskSpawner::new(agent))
        .build()?;

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("[EVENT] {:?}", event.payload);
        }
    });

    coordinator.start(config.worker_count).await?;

    let stalled = coordinator.submit(TextJob::Stall, false);
    let jobs = [
        TextJob::WordCount {
            text: "the quick brown fox".into(),
        },
        TextJob::Shout {
            text: "hello from a worker".into(),
        },
        TextJob::WordCount {
            text: "jumps over the lazy dog".into(),
        },
    ];
    let tickets: Vec<_> = jobs
        .into_iter()
        .map(|job| coordinator.submit(job, false))
        .collect();

    for ticket in tickets {
        println!("[RESULT] {:?}", ticket.await);
    }
    println!("[RESULT] stalled job: {:?}", stalled.await);

    let snapshot = coordinator.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    coordinator.shutdown().await?;
    Ok(())
}
