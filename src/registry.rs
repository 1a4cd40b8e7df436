//! Agent registry
//!
//! Owns every [`Agent`] record. The mailbox and the supervisor refer to agents
//! by id only and route all status changes through [`AgentRegistry::update_status`].

use crate::store::KvStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

const AGENTS_TREE: &str = "agents";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Ok(AgentStatus::Idle),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("unknown agent status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// Project directory used by the process supervisor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// A new agent starts `offline`: not running until something starts it
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities: BTreeSet::new(),
            status: AgentStatus::Offline,
            path: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Ids are used as storage key prefixes and as directory names, so they must
/// be a single non-empty path segment
pub fn is_valid_agent_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && !id.contains("..")
        && !id.contains(|c: char| matches!(c, '/' | '\\') || c.is_control())
}

/// Agent roster persisted in the `agents` keyspace
#[derive(Clone)]
pub struct AgentRegistry {
    store: KvStore,
}

impl AgentRegistry {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Insert or replace an agent record
    pub fn register(&self, agent: &Agent) -> Result<()> {
        anyhow::ensure!(is_valid_agent_id(&agent.id), "invalid agent id '{}'", agent.id);
        self.store.set(AGENTS_TREE, &agent.id, agent)?;
        self.store.flush()?;
        tracing::debug!("Registered agent {} ({})", agent.id, agent.agent_type);
        Ok(())
    }

    /// Remove an agent record, returning it if it existed
    pub fn unregister(&self, id: &str) -> Result<Option<Agent>> {
        let existing = self.get(id)?;
        if existing.is_some() {
            self.store.delete(AGENTS_TREE, id)?;
            self.store.flush()?;
        }
        Ok(existing)
    }

    pub fn get(&self, id: &str) -> Result<Option<Agent>> {
        self.store.get(AGENTS_TREE, id)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        self.store.contains(AGENTS_TREE, id)
    }

    pub fn list(&self) -> Result<Vec<Agent>> {
        self.store.get_all(AGENTS_TREE)
    }

    pub fn by_type(&self, agent_type: &str) -> Result<Vec<Agent>> {
        self.filter(|a| a.agent_type == agent_type)
    }

    pub fn by_capability(&self, capability: &str) -> Result<Vec<Agent>> {
        self.filter(|a| a.has_capability(capability))
    }

    pub fn by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        self.filter(|a| a.status == status)
    }

    fn filter(&self, predicate: impl Fn(&Agent) -> bool) -> Result<Vec<Agent>> {
        Ok(self.list()?.into_iter().filter(|a| predicate(a)).collect())
    }

    /// The single entrypoint for status changes. `None` if the agent is unknown.
    pub fn update_status(&self, id: &str, status: AgentStatus) -> Result<Option<Agent>> {
        self.modify(id, |agent| agent.status = status)
    }

    pub fn update_metadata(
        &self,
        id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<Option<Agent>> {
        self.modify(id, |agent| {
            agent.metadata.insert(key.to_string(), value);
        })
    }

    pub fn set_path(&self, id: &str, path: PathBuf) -> Result<Option<Agent>> {
        self.modify(id, |agent| agent.path = Some(path))
    }

    fn modify(&self, id: &str, change: impl FnOnce(&mut Agent)) -> Result<Option<Agent>> {
        let Some(mut agent) = self.get(id)? else {
            return Ok(None);
        };
        change(&mut agent);
        agent.updated_at = Utc::now();
        self.store.set(AGENTS_TREE, id, &agent)?;
        self.store.flush()?;
        Ok(Some(agent))
    }
}
