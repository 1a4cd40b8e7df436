//! Composition root
//!
//! One [`MeshRuntime`] is one orchestration run: it owns the event bus and the
//! error handling and hands them to the components that need them.

use crate::config::MeshConfig;
use crate::errors::{ErrorHandling, RetryOptions};
use crate::events_bus::EventBus;
use crate::mailbox::{Mailbox, MailboxResult};
use crate::registry::AgentRegistry;
use crate::scheduler::{CapabilityRegistry, TaskScheduler};
use crate::supervisor::ProcessSupervisor;
use std::sync::Arc;

pub struct MeshRuntime {
    config: MeshConfig,
    bus: Arc<EventBus>,
    errors: Arc<ErrorHandling>,
    mailbox: Arc<Mailbox>,
    scheduler: TaskScheduler,
    supervisor: ProcessSupervisor,
}

impl MeshRuntime {
    /// Build every component with an empty capability registry
    pub fn open(config: MeshConfig) -> MailboxResult<Self> {
        Self::open_with_capabilities(config, CapabilityRegistry::new())
    }

    pub fn open_with_capabilities(
        config: MeshConfig,
        capabilities: CapabilityRegistry,
    ) -> MailboxResult<Self> {
        let bus = Arc::new(EventBus::new());
        let errors = Arc::new(ErrorHandling::new(Arc::clone(&bus)));
        let mailbox = Arc::new(Mailbox::open(&config.storage.root)?);
        let scheduler = TaskScheduler::new(
            &config.scheduler,
            Arc::clone(&bus),
            Arc::clone(&errors),
            capabilities,
        );
        let supervisor = ProcessSupervisor::new(config.supervisor.clone(), Arc::clone(&mailbox));
        match supervisor.recover_stale() {
            Ok(ids) if !ids.is_empty() => {
                tracing::info!("Marked {} stale agent(s) offline: {}", ids.len(), ids.join(", "))
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to recover stale agents: {}", e),
        }

        tracing::info!("Mesh runtime opened at {}", config.storage.root.display());
        Ok(Self {
            config,
            bus,
            errors,
            mailbox,
            scheduler,
            supervisor,
        })
    }

    /// Start the scheduler's worker pool
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stop supervised agents, then the worker pool
    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
        self.scheduler.shutdown().await;
        tracing::info!("Mesh runtime shut down");
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn errors(&self) -> &Arc<ErrorHandling> {
        &self.errors
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn registry(&self) -> &AgentRegistry {
        self.mailbox.registry()
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Retry defaults from the `[retry]` section
    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions::from(&self.config.retry)
    }
}
