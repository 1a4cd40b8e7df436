//! Severity-keyed error handler chains
//!
//! Handlers registered for a severity are tried first, in registration order,
//! then the fallback chain. The first handler returning `true` claims the
//! error. The built-in [`LoggingFallback`] never claims anything; it logs and
//! publishes the error on the bus so that an unhandled error is always visible.

use super::{AgentError, ErrorContext, ErrorSource, Severity};
use crate::events_bus::{events, EventBus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// A link in a handler chain. Returns true to mark the error handled.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, error: &AgentError) -> bool;
}

/// Plain closures work as synchronous handlers
#[async_trait]
impl<F> ErrorHandler for F
where
    F: Fn(&AgentError) -> bool + Send + Sync,
{
    async fn handle(&self, error: &AgentError) -> bool {
        self(error)
    }
}

/// Default fallback: log at a level derived from severity and publish `"error"`
pub struct LoggingFallback {
    bus: Arc<EventBus>,
}

impl LoggingFallback {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ErrorHandler for LoggingFallback {
    async fn handle(&self, error: &AgentError) -> bool {
        let original = error
            .original
            .as_ref()
            .map(|e| format!("{:#}", e))
            .unwrap_or_default();

        match error.severity {
            Severity::Info => {
                tracing::info!(source = %error.source, original = %original, "{}", error.message)
            }
            Severity::Warning => {
                tracing::warn!(source = %error.source, original = %original, "{}", error.message)
            }
            Severity::Error | Severity::Critical => tracing::error!(
                severity = %error.severity,
                source = %error.source,
                original = %original,
                "{}",
                error.message
            ),
        }

        self.bus
            .publish(events::ERROR, error.to_event_payload())
            .await;

        // Never claims the error, so specific handlers always win
        false
    }
}

type HandlerChain = Vec<Arc<dyn ErrorHandler>>;

pub struct ErrorHandling {
    bus: Arc<EventBus>,
    handlers: RwLock<HashMap<Severity, HandlerChain>>,
    fallbacks: RwLock<HandlerChain>,
}

impl ErrorHandling {
    /// Create a handler registry with the [`LoggingFallback`] installed
    pub fn new(bus: Arc<EventBus>) -> Self {
        let handling = Self {
            bus: Arc::clone(&bus),
            handlers: RwLock::new(HashMap::new()),
            fallbacks: RwLock::new(Vec::new()),
        };
        handling.register_fallback_handler(Arc::new(LoggingFallback::new(bus)));
        handling
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn create_error(
        &self,
        message: impl Into<String>,
        severity: Severity,
        source: ErrorSource,
        original: Option<anyhow::Error>,
        context: Option<ErrorContext>,
    ) -> AgentError {
        AgentError::new(message, severity, source, original, context)
    }

    pub fn register_handler(&self, severity: Severity, handler: Arc<dyn ErrorHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(severity)
            .or_default()
            .push(handler);
    }

    pub fn register_fallback_handler(&self, handler: Arc<dyn ErrorHandler>) {
        self.fallbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Run the error through its severity chain, then the fallbacks.
    /// Sets `error.handled` and returns true as soon as a handler claims it.
    pub async fn handle_error(&self, error: &mut AgentError) -> bool {
        // Snapshot the chains so no lock is held across handler awaits
        let specific: HandlerChain = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&error.severity)
            .cloned()
            .unwrap_or_default();
        let fallbacks: HandlerChain = self
            .fallbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for handler in specific.iter().chain(fallbacks.iter()) {
            if handler.handle(error).await {
                error.handled = true;
                return true;
            }
        }

        false
    }
}
