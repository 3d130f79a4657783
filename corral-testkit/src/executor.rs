use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral::{Executor, ExecutorFactory, Executors, JobHandler, WorkerAgent, WorkerConfig};
use parking_lot::Mutex;

use crate::{TestJob, TEST_EXECUTOR};

/// Work handle produced by [`TestExecutorFactory`] resources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestUnit {
    pub executor: String,
    pub serial: u64,
}

/// Lifecycle calls observed across every resource of one factory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutorCounts {
    pub resources_created: usize,
    pub units_created: usize,
    pub units_released: usize,
    pub exits: usize,
}

#[derive(Clone)]
pub struct TestExecutorFactory {
    name: String,
    counts: Arc<Mutex<ExecutorCounts>>,
    fail_create: bool,
    fail_units: bool,
    exit_delay: Option<Duration>,
}

impl TestExecutorFactory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counts: Arc::new(Mutex::new(ExecutorCounts::default())),
            fail_create: false,
            fail_units: false,
            exit_delay: None,
        }
    }

    /// Resource creation fails, so the worker never becomes ready.
    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Every `create_unit` call fails.
    pub fn failing_units(mut self) -> Self {
        self.fail_units = true;
        self
    }

    /// `exit` takes this long to resolve.
    pub fn with_exit_delay(mut self, delay: Duration) -> Self {
        self.exit_delay = Some(delay);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counts(&self) -> ExecutorCounts {
        self.counts.lock().clone()
    }
}

impl Default for TestExecutorFactory {
    fn default() -> Self {
        Self::new(TEST_EXECUTOR)
    }
}

#[async_trait]
impl ExecutorFactory<TestUnit> for TestExecutorFactory {
    async fn create(&self) -> anyhow::Result<Box<dyn Executor<TestUnit>>> {
        if self.fail_create {
            anyhow::bail!("{} refused to start", self.name);
        }
        self.counts.lock().resources_created += 1;
        Ok(Box::new(TestExecutor {
            name: self.name.clone(),
            counts: Arc::clone(&self.counts),
            fail_units: self.fail_units,
            exit_delay: self.exit_delay,
            next_serial: AtomicU64::new(0),
        }))
    }
}

struct TestExecutor {
    name: String,
    counts: Arc<Mutex<ExecutorCounts>>,
    fail_units: bool,
    exit_delay: Option<Duration>,
    next_serial: AtomicU64,
}

#[async_trait]
impl Executor<TestUnit> for TestExecutor {
    async fn create_unit(&self) -> anyhow::Result<TestUnit> {
        if self.fail_units {
            anyhow::bail!("{} has no units left", self.name);
        }
        self.counts.lock().units_created += 1;
        Ok(TestUnit {
            executor: self.name.clone(),
            serial: self.next_serial.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn release_unit(&self, _unit: TestUnit) {
        self.counts.lock().units_released += 1;
    }

    async fn exit(&self) -> anyhow::Result<()> {
        if let Some(delay) = self.exit_delay {
            tokio::time::sleep(delay).await;
        }
        self.counts.lock().exits += 1;
        Ok(())
    }
}

/// Runs [`TestJob`]s and tracks how many run at once.
#[derive(Clone, Default)]
pub struct TestHandler {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    handled: Arc<Mutex<Vec<TestJob>>>,
}

impl TestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently inside [`JobHandler::handle`].
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of jobs ever handled at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every payload handed to this handler, in start order.
    pub fn handled(&self) -> Vec<TestJob> {
        self.handled.lock().clone()
    }

    fn enter(&self) -> RunningGuard {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        RunningGuard(Arc::clone(&self.running))
    }
}

/// Decrements the running count even when the job is aborted.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobHandler<TestJob, TestUnit> for TestHandler {
    async fn handle(&self, unit: &mut TestUnit, payload: TestJob) -> Result<String, String> {
        let _running = self.enter();
        self.handled.lock().push(payload.clone());
        match payload {
            TestJob::Echo { value } => Ok(value),
            TestJob::Sleep { ms, value } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(value)
            }
            TestJob::Hang => std::future::pending().await,
            TestJob::Fail { error } => Err(error),
            TestJob::Route { value, .. } => Ok(format!("{}:{}", unit.executor, value)),
        }
    }
}

/// A worker agent wired to [`TestExecutorFactory`]s and a [`TestHandler`].
pub struct TestAgent {
    pub agent: WorkerAgent<TestJob, TestUnit>,
    pub factories: Vec<TestExecutorFactory>,
    pub handler: TestHandler,
}

impl TestAgent {
    /// Agent with the single [`TEST_EXECUTOR`] executor.
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_factories(config, vec![TestExecutorFactory::default()])
    }

    pub fn with_factories(config: WorkerConfig, factories: Vec<TestExecutorFactory>) -> Self {
        let handler = TestHandler::new();
        let executors = factories.iter().fold(Executors::<TestUnit>::new(), |executors, factory| {
            executors.with(factory.name().to_string(), Arc::new(factory.clone()))
        });
        let agent: WorkerAgent<TestJob, TestUnit> =
            WorkerAgent::new(config, executors, Arc::new(handler.clone()));
        Self {
            agent,
            factories,
            handler,
        }
    }

    /// Counts of the first factory.
    pub fn counts(&self) -> ExecutorCounts {
        self.factories
            .first()
            .map(TestExecutorFactory::counts)
            .unwrap_or_default()
    }
}
