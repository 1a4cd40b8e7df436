//! In-process agents owned by the scheduler
//!
//! An agent offers each task description to its capability modules in load
//! order. The first module to claim it wins; a module that errors or panics is
//! logged and skipped. Unclaimed descriptions go to the agent's [`TaskExecutor`].

use super::capability::{CapabilityModule, CapabilityRegistry, TaskClaim};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capabilities every agent has
pub const DEFAULT_CAPABILITIES: [&str; 3] = ["task-execution", "messaging", "error-handling"];

/// The agent's own handler for descriptions no module claimed
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, description: &str, cancel: CancellationToken) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> TaskExecutor for F
where
    F: Fn(String, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn execute(&self, description: &str, cancel: CancellationToken) -> anyhow::Result<Value> {
        self(description.to_string(), cancel).await
    }
}

/// Default executor: acknowledges the description without interpreting it
pub struct AcknowledgeExecutor {
    agent_name: String,
}

#[async_trait]
impl TaskExecutor for AcknowledgeExecutor {
    async fn execute(&self, description: &str, _cancel: CancellationToken) -> anyhow::Result<Value> {
        Ok(json!({
            "agent": self.agent_name,
            "description": description,
            "handledBy": "default",
        }))
    }
}

/// Public view of an agent, also handed to modules
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub modules: Vec<String>,
}

impl AgentInfo {
    pub fn new(name: &str, capabilities: BTreeSet<String>, modules: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            modules,
        }
    }
}

pub struct AgentConfig {
    pub name: String,
    pub capabilities: Vec<String>,
    /// Capability module names, resolved through the [`CapabilityRegistry`]
    pub modules: Vec<String>,
    pub executor: Option<Arc<dyn TaskExecutor>>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Vec::new(),
            modules: Vec::new(),
            executor: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.push(module.into());
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }
}

pub struct AgentHandle {
    info: AgentInfo,
    modules: Vec<Arc<dyn CapabilityModule>>,
    executor: Arc<dyn TaskExecutor>,
}

impl AgentHandle {
    /// Resolve and initialize the configured modules. Unknown modules and
    /// modules failing to initialize are skipped with a warning.
    pub(crate) async fn build(config: AgentConfig, registry: &CapabilityRegistry) -> Self {
        let mut capabilities: BTreeSet<String> =
            DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect();
        capabilities.extend(config.capabilities);

        let mut candidates = Vec::new();
        for name in &config.modules {
            match registry.resolve(name) {
                Some(module) => candidates.push((name.clone(), module)),
                None => tracing::warn!(
                    "Agent {}: unknown capability module '{}', skipping",
                    config.name,
                    name
                ),
            }
        }
        capabilities.extend(candidates.iter().map(|(name, _)| name.clone()));

        let mut info = AgentInfo::new(&config.name, capabilities, Vec::new());
        let mut modules = Vec::new();
        for (name, module) in candidates {
            match module.initialize(&info).await {
                Ok(()) => {
                    info.modules.push(name);
                    modules.push(module);
                }
                Err(e) => {
                    info.capabilities.remove(&name);
                    tracing::warn!(
                        "Agent {}: module '{}' failed to initialize: {:#}",
                        config.name,
                        name,
                        e
                    );
                }
            }
        }

        let executor = config.executor.unwrap_or_else(|| {
            Arc::new(AcknowledgeExecutor {
                agent_name: config.name.clone(),
            })
        });

        Self {
            info,
            modules,
            executor,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    /// Offer the description to each module, then fall back to the executor
    pub async fn dispatch(&self, description: &str, cancel: CancellationToken) -> anyhow::Result<Value> {
        for module in &self.modules {
            let attempt = AssertUnwindSafe(module.handle_task(description, &self.info))
                .catch_unwind()
                .await;
            match attempt {
                Ok(Ok(TaskClaim::Handled(result))) => {
                    tracing::debug!("Agent {}: task handled by '{}'", self.info.name, module.name());
                    return Ok(result);
                }
                Ok(Ok(TaskClaim::Pass)) => {}
                Ok(Err(e)) => tracing::warn!(
                    "Agent {}: module '{}' failed on task: {:#}",
                    self.info.name,
                    module.name(),
                    e
                ),
                Err(_) => tracing::error!(
                    "Agent {}: module '{}' panicked on task",
                    self.info.name,
                    module.name()
                ),
            }
        }

        self.executor.execute(description, cancel).await
    }

    pub(crate) async fn cleanup(&self) {
        for module in &self.modules {
            if let Err(e) = module.cleanup().await {
                tracing::warn!(
                    "Agent {}: module '{}' cleanup failed: {:#}",
                    self.info.name,
                    module.name(),
                    e
                );
            }
        }
    }
}
