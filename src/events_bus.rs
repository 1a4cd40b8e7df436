//! Publish/subscribe event bus shared by the orchestration components
//!
//! One bus is constructed per orchestration run and handed to every component
//! that publishes or listens. Handlers are async closures receiving the event
//! payload; every handler registered for an event is attempted on each
//! publish, and a failing (or panicking) handler never prevents the others
//! from running.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Well-known event names
pub mod events {
    /// Published by the default error fallback for every error it sees
    pub const ERROR: &str = "error";
    pub const TASK_QUEUED: &str = "task-queued";
    pub const TASK_STARTED: &str = "task-started";
    pub const TASK_COMPLETED: &str = "task-completed";
    pub const TASK_FAILED: &str = "task-failed";
    pub const TASK_CANCELLED: &str = "task-cancelled";

    /// Task-scoped variant of a task event, e.g. `task-completed:<id>`
    pub fn scoped(event: &str, task_id: &str) -> String {
        format!("{}:{}", event, task_id)
    }
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;
type Handler = Arc<dyn Fn(Arc<Value>) -> HandlerFuture + Send + Sync>;

/// Token identifying one registration, used to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub event: String,
    id: u64,
}

struct Subscriber {
    id: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler invoked on every publish of `event`
    pub fn subscribe<F, Fut>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(Arc<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(event, false, handler)
    }

    /// Register a handler removed after its first invocation, whatever its outcome
    pub fn once<F, Fut>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(Arc<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(event, true, handler)
    }

    fn add<F, Fut>(&self, event: &str, once: bool, handler: F) -> Subscription
    where
        F: Fn(Arc<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |data| handler(data).boxed());

        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(Subscriber { id, once, handler });

        Subscription {
            event: event.to_string(),
            id,
        }
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(list) = subscribers.get_mut(&subscription.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != subscription.id);
        let removed = list.len() != before;

        if list.is_empty() {
            subscribers.remove(&subscription.event);
        }
        removed
    }

    /// Invoke every handler registered for `event` and wait for all of them.
    ///
    /// Once-handlers are detached before anything runs. Handler errors and
    /// panics are logged and swallowed. Returns the number of handlers attempted.
    pub async fn publish(&self, event: &str, data: Value) -> usize {
        let handlers: Vec<Handler> = {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);

            let Some(list) = subscribers.get_mut(event) else {
                return 0;
            };
            let handlers = list.iter().map(|s| Arc::clone(&s.handler)).collect();
            list.retain(|s| !s.once);
            if list.is_empty() {
                subscribers.remove(event);
            }
            handlers
        };

        if handlers.is_empty() {
            return 0;
        }

        let data = Arc::new(data);
        let futures: Vec<_> = handlers
            .iter()
            .map(|handler| {
                let data = Arc::clone(&data);
                // A handler may panic before producing its future
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler(data))) {
                    Ok(fut) => AssertUnwindSafe(fut).catch_unwind().boxed(),
                    Err(_) => futures::future::ready(Err(Box::new("handler panicked")
                        as Box<dyn std::any::Any + Send>))
                    .boxed(),
                }
            })
            .collect();

        let attempted = futures.len();
        for result in join_all(futures).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(event = %event, "Event handler failed: {:#}", e),
                Err(_) => tracing::error!(event = %event, "Event handler panicked"),
            }
        }

        attempted
    }

    pub fn has_subscribers(&self, event: &str) -> bool {
        self.subscriber_count(event) > 0
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Drop every registration for every event
    pub fn clear(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
