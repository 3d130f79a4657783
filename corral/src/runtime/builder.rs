use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::CorralConfig;
use crate::events::EventBus;
use crate::job::JobPayload;

use super::coordinator::{Coordinator, CoordinatorConfig};
use super::transport::WorkerSpawner;

/// Builder for a [`Coordinator`] with explicit dependencies.
///
/// # Example
///
/// ```ignore
/// use corral::*;
///
/// let coordinator = CoordinatorBuilder::<MyJob>::new(config)
///     .with_spawner(TaskSpawner::new(agent))
///     .build()?;
/// coordinator.start(config.worker_count).await?;
/// ```
pub struct CoordinatorBuilder<J: JobPayload> {
    config: CoordinatorConfig,
    spawner: Option<Arc<dyn WorkerSpawner<J>>>,
    spawner_type: Option<&'static str>,
    events: Option<EventBus>,
}

impl<J: JobPayload> fmt::Debug for CoordinatorBuilder<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CoordinatorBuilder");
        debug.field("config", &self.config);
        debug.field("payload_type", &type_name::<J>());
        debug.field("spawner_set", &self.spawner.is_some());
        debug.field("events_set", &self.events.is_some());

        if let Some(spawner_type) = self.spawner_type {
            debug.field("spawner_type", &spawner_type);
        }

        debug.finish()
    }
}

impl<J: JobPayload> CoordinatorBuilder<J> {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            spawner: None,
            spawner_type: None,
            events: None,
        }
    }

    /// Start from the coordinator half of a [`CorralConfig`].
    pub fn from_config(config: &CorralConfig) -> Self {
        Self::new(config.coordinator())
    }

    /// Set how workers are started.
    pub fn with_spawner<S: WorkerSpawner<J>>(mut self, spawner: S) -> Self {
        self.spawner = Some(Arc::new(spawner));
        self.spawner_type = Some(type_name::<S>());
        self
    }

    /// Publish lifecycle events on an existing bus instead of a new one.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Build a stopped coordinator. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the spawner is missing or the job timeout is zero.
    pub fn build(self) -> anyhow::Result<Coordinator<J>> {
        let spawner = self
            .spawner
            .ok_or_else(|| anyhow::anyhow!("spawner dependency missing"))?;
        if self.config.job_timeout_ms == 0 {
            anyhow::bail!("job timeout must be greater than zero");
        }
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(self.config.event_capacity));

        Ok(Coordinator::from_parts(self.config, spawner, events))
    }
}
