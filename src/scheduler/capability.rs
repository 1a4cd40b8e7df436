//! Capability modules and their name → constructor registry

use super::agent::AgentInfo;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// What a module did with a task description
#[derive(Debug, Clone, PartialEq)]
pub enum TaskClaim {
    /// The module handled the task and produced this result
    Handled(Value),
    /// Not for this module; offer it to the next one
    Pass,
}

/// Pluggable task interpreter loaded into an agent by name
#[async_trait]
pub trait CapabilityModule: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, agent: &AgentInfo) -> anyhow::Result<()> {
        let _ = agent;
        Ok(())
    }

    async fn handle_task(&self, description: &str, agent: &AgentInfo) -> anyhow::Result<TaskClaim> {
        let _ = (description, agent);
        Ok(TaskClaim::Pass)
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type ModuleConstructor = Arc<dyn Fn() -> Arc<dyn CapabilityModule> + Send + Sync>;

/// Modules known by name. Each agent gets a fresh instance from the constructor.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    constructors: Arc<RwLock<HashMap<String, ModuleConstructor>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `name`
    pub fn register<F>(&self, name: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn CapabilityModule> + Send + Sync + 'static,
    {
        let replaced = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(constructor))
            .is_some();
        if replaced {
            tracing::debug!("Replaced capability module constructor '{}'", name);
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn CapabilityModule>> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()?;
        Some(constructor())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
