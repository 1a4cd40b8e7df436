//! Multi-agent shared tasks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A task assigned to several agents. Written once at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub creator: String,
    pub assignees: Vec<String>,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl SharedTask {
    /// Creator first, then assignees, without duplicates
    pub fn participants(&self) -> Vec<String> {
        let mut participants = vec![self.creator.clone()];
        for assignee in &self.assignees {
            if !participants.contains(assignee) {
                participants.push(assignee.clone());
            }
        }
        participants
    }

    pub fn involves(&self, agent_id: &str) -> bool {
        self.creator == agent_id || self.assignees.iter().any(|a| a == agent_id)
    }
}

/// One agent's latest report on a shared task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStatus {
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A shared task together with its per-agent status map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedTaskView {
    #[serde(flatten)]
    pub task: SharedTask,
    pub statuses: BTreeMap<String, ParticipantStatus>,
}
