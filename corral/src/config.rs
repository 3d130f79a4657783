use serde::{Deserialize, Serialize};

use crate::error::{CorralError, Result};
use crate::job::RetryLimit;
use crate::runtime::{CoordinatorConfig, WorkerConfig};

/// The recognised configuration surface, shared by coordinator and workers.
///
/// Every field has a default, so `{}` is a valid document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorralConfig {
    /// Target number of live workers.
    pub worker_count: usize,
    /// Per-job deadline in milliseconds.
    pub job_timeout_ms: u64,
    /// Retries allowed after a deadline expiry; `-1` means unlimited.
    pub max_retries: RetryLimit,
    /// A worker recycles after completing this many jobs.
    pub worker_recycle_after_jobs: u32,
    /// A worker recycles after this many milliseconds; absent or negative
    /// disables the lifetime limit.
    pub worker_recycle_after_ms: Option<i64>,
    /// Jobs a single worker may hold at once.
    pub concurrency_per_worker: usize,
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            job_timeout_ms: 30_000,
            max_retries: RetryLimit::Unlimited,
            worker_recycle_after_jobs: 25,
            worker_recycle_after_ms: None,
            concurrency_per_worker: 1,
        }
    }
}

impl CorralConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(CorralError::Config("workerCount must be at least 1".into()));
        }
        if self.job_timeout_ms == 0 {
            return Err(CorralError::Config("jobTimeoutMs must be positive".into()));
        }
        if self.worker_recycle_after_jobs == 0 {
            return Err(CorralError::Config(
                "workerRecycleAfterJobs must be at least 1".into(),
            ));
        }
        if self.concurrency_per_worker == 0 {
            return Err(CorralError::Config(
                "concurrencyPerWorker must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_worker_count(self.worker_count)
            .with_job_timeout(self.job_timeout_ms)
            .with_max_retries(self.max_retries)
    }

    pub fn worker(&self) -> WorkerConfig {
        let lifetime = self
            .worker_recycle_after_ms
            .and_then(|ms| u64::try_from(ms).ok());
        WorkerConfig::default()
            .with_recycle_after_jobs(self.worker_recycle_after_jobs)
            .with_recycle_after(lifetime)
            .with_concurrency(self.concurrency_per_worker)
    }
}
