//! Pluggable task executors used by the worker agent.
//!
//! A worker owns one [`Executor`] resource per configured executor kind,
//! created at startup by the matching [`ExecutorFactory`]. For each job the
//! agent asks the executor named by the payload for a work handle `H`, hands
//! it to the application's [`JobHandler`], then gives it back with
//! [`Executor::release_unit`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::job::JobPayload;

/// Creates the long-lived resource behind one executor kind.
#[async_trait]
pub trait ExecutorFactory<H>: Send + Sync {
    async fn create(&self) -> anyhow::Result<Box<dyn Executor<H>>>;
}

/// A live executor resource owned by exactly one worker.
#[async_trait]
pub trait Executor<H>: Send + Sync {
    /// Produce a work handle for one job.
    async fn create_unit(&self) -> anyhow::Result<H>;

    /// Clean up a handle once its job finished.
    async fn release_unit(&self, unit: H);

    /// Tear the resource down, resolving once teardown has completed.
    async fn exit(&self) -> anyhow::Result<()>;
}

/// The embedding application's per-job logic.
///
/// Returning is the job's completion: `Ok` carries the result, `Err` an
/// executor error that is reported to the submitter and never retried. A
/// handler that never returns is recovered by the coordinator's deadline.
#[async_trait]
pub trait JobHandler<J: JobPayload, H>: Send + Sync {
    async fn handle(&self, unit: &mut H, payload: J) -> Result<J::Output, String>;
}

/// Named executor factories supplied by the application.
pub struct Executors<H> {
    factories: BTreeMap<String, Arc<dyn ExecutorFactory<H>>>,
}

impl<H> Default for Executors<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Clone for Executors<H> {
    fn clone(&self) -> Self {
        Self {
            factories: self.factories.clone(),
        }
    }
}

impl<H> fmt::Debug for Executors<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executors")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<H> Executors<H> {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn with(
        mut self,
        name: impl Into<String>,
        factory: Arc<dyn ExecutorFactory<H>>,
    ) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn ExecutorFactory<H>>)> {
        self.factories.iter()
    }
}
