//! Child-process worker serving [`TestJob`](corral_testkit::TestJob)s on
//! stdio, for tests that run `ProcessSpawner` against real worker binaries.
//!
//! `CORRAL_TEST_RECYCLE_AFTER` sets the recycle threshold.

use anyhow::Context;
use corral::runtime::stdio;
use corral::WorkerConfig;
use corral_testkit::{TestAgent, RECYCLE_AFTER_ENV};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = WorkerConfig::default();
    if let Ok(raw) = std::env::var(RECYCLE_AFTER_ENV) {
        let jobs = raw
            .parse()
            .with_context(|| format!("{RECYCLE_AFTER_ENV}={raw:?} is not a job count"))?;
        config = config.with_recycle_after_jobs(jobs);
    }

    stdio::serve(TestAgent::new(config).agent).await?;
    Ok(())
}
