//! Task records and priorities

use super::SchedulerError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "0" => Ok(TaskPriority::Low),
            "normal" | "1" => Ok(TaskPriority::Normal),
            "high" | "2" => Ok(TaskPriority::High),
            "critical" | "3" => Ok(TaskPriority::Critical),
            other => Err(format!("unknown task priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Snapshot of a scheduled task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub agent_name: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub(crate) fn new(id: String, agent_name: &str, description: &str, priority: TaskPriority) -> Self {
        Self {
            id,
            agent_name: agent_name.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub(crate) fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Turn a terminal snapshot into what a waiting caller receives
    pub fn into_result(self) -> Result<Value, SchedulerError> {
        match self.status {
            TaskStatus::Completed => Ok(self.result.unwrap_or(Value::Null)),
            TaskStatus::Cancelled => Err(SchedulerError::TaskCancelled(self.id)),
            TaskStatus::Failed => Err(SchedulerError::TaskFailed {
                message: self.error.unwrap_or_else(|| "unknown error".to_string()),
                id: self.id,
            }),
            TaskStatus::Pending | TaskStatus::Running => Err(SchedulerError::ShutDown),
        }
    }
}

/// The unit of work a task owns. It receives the task's cancellation token.
pub type TaskWork =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

/// Returned by a task body that stopped because its token fired.
/// The task is then recorded as cancelled instead of failed.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("task cancelled")]
pub struct TaskCancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_and_parsing() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
        assert_eq!("3".parse::<TaskPriority>().unwrap(), TaskPriority::Critical);
        assert!("urgent".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn test_into_result() {
        let mut task = Task::new("task_1".into(), "a", "d", TaskPriority::Low);
        task.status = TaskStatus::Failed;
        task.error = Some("boom".into());

        match task.into_result() {
            Err(SchedulerError::TaskFailed { id, message }) => {
                assert_eq!(id, "task_1");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut task = Task::new("task_2".into(), "a", "d", TaskPriority::Low);
        task.status = TaskStatus::Completed;
        task.result = Some(serde_json::json!(42));
        assert_eq!(task.into_result().unwrap(), 42);
    }
}
