//! Error handling subsystem
//!
//! - [`AgentError`]: a two-axis (severity × source) error record
//! - [`ErrorHandling`]: severity-keyed handler chains plus fallbacks
//! - [`retry`]: retry-with-backoff helper

pub mod handler;
pub mod retry;

pub use handler::{ErrorHandler, ErrorHandling, LoggingFallback};
pub use retry::{backoff_delay, retry, RetryMatcher, RetryOptions};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Where an error originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Module,
    McpServer,
    McpClient,
    Framework,
    External,
}

impl std::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSource::Module => write!(f, "module"),
            ErrorSource::McpServer => write!(f, "mcp_server"),
            ErrorSource::McpClient => write!(f, "mcp_client"),
            ErrorSource::Framework => write!(f, "framework"),
            ErrorSource::External => write!(f, "external"),
        }
    }
}

/// Free-form context attached to an error, always timestamped at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub values: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            values: HashMap::new(),
        }
    }

    pub fn with<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// An error flowing once through the handler chain.
///
/// Never persisted. `handled` is flipped by [`ErrorHandling::handle_error`]
/// when some handler claims the error.
#[derive(Debug)]
pub struct AgentError {
    pub message: String,
    pub severity: Severity,
    pub source: ErrorSource,
    pub original: Option<anyhow::Error>,
    pub context: ErrorContext,
    pub handled: bool,
}

impl AgentError {
    /// Build an unhandled error. The context timestamp is always re-stamped.
    pub fn new(
        message: impl Into<String>,
        severity: Severity,
        source: ErrorSource,
        original: Option<anyhow::Error>,
        context: Option<ErrorContext>,
    ) -> Self {
        let mut context = context.unwrap_or_default();
        context.timestamp = Utc::now();

        Self {
            message: message.into(),
            severity,
            source,
            original,
            context,
            handled: false,
        }
    }

    /// JSON payload used when the error is published on the bus
    pub fn to_event_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "message": self.message,
            "severity": self.severity,
            "source": self.source,
            "original": self.original.as_ref().map(|e| format!("{:#}", e)),
            "context": self.context,
            "handled": self.handled,
        })
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.severity, self.source, self.message)
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.original
            .as_ref()
            .map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}
