//! Test doubles for corral: scripted payloads, executors, a handler that
//! counts concurrency, and a spawner whose workers the test drives by hand.

mod executor;
mod job;
mod mock;

pub use executor::{ExecutorCounts, TestAgent, TestExecutorFactory, TestHandler, TestUnit};
pub use job::{TestJob, TEST_EXECUTOR};
pub use mock::{ScriptedSpawner, ScriptedWorker, ScriptedWorkers};

use std::time::Duration;

/// Recycle threshold read by the `corral-test-worker` binary.
pub const RECYCLE_AFTER_ENV: &str = "CORRAL_TEST_RECYCLE_AFTER";

/// Poll `check` every few milliseconds until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Sample `coordinator` until a snapshot satisfies `check`.
///
/// Returns the matching snapshot, or `None` once `within` elapses.
pub async fn wait_for_snapshot<J, F>(
    coordinator: &corral::Coordinator<J>,
    within: Duration,
    check: F,
) -> Option<corral::PoolSnapshot>
where
    J: corral::JobPayload,
    F: Fn(&corral::PoolSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let snapshot = coordinator.snapshot().await.ok()?;
        if check(&snapshot) {
            return Some(snapshot);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
