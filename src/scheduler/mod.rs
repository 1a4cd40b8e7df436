//! Priority task scheduler with a bounded worker pool
//!
//! Tasks are queued by descending priority (FIFO within a priority) and pulled
//! by `max_concurrent_tasks` workers. Enqueue wakes a worker through a
//! [`Notify`]; workers also re-check the queue every poll interval.
//!
//! Every task carries a [`CancellationToken`]. [`TaskScheduler::cancel_task`]
//! only removes pending tasks; [`TaskScheduler::signal_cancellation`] fires the
//! token of a running one and leaves the outcome to the task body.
//!
//! Lifecycle events (`task-queued`, `task-started`, `task-completed`,
//! `task-failed`, `task-cancelled`) are published globally and scoped to the
//! task id, e.g. `task-completed:<id>`.

pub mod agent;
pub mod capability;
mod queue;
pub mod task;

pub use agent::{AgentConfig, AgentHandle, AgentInfo, TaskExecutor, DEFAULT_CAPABILITIES};
pub use capability::{CapabilityModule, CapabilityRegistry, TaskClaim};
pub use task::{Task, TaskCancelled, TaskPriority, TaskStatus, TaskWork};

use crate::config::SchedulerConfig;
use crate::errors::{ErrorContext, ErrorHandling, ErrorSource, Severity};
use crate::events_bus::{events, EventBus};
use crate::utils::generate_id;
use chrono::Utc;
use futures::FutureExt;
use queue::TaskQueue;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent already exists: {0}")]
    AgentExists(String),

    #[error("Task {id} failed: {message}")]
    TaskFailed { id: String, message: String },

    #[error("Task {0} was cancelled")]
    TaskCancelled(String),

    #[error("Scheduler is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions {
    pub priority: TaskPriority,
    /// Wait for the task to finish (default) or return once it is queued
    pub wait_for_completion: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            priority: TaskPriority::Normal,
            wait_for_completion: true,
        }
    }
}

impl ExecuteOptions {
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.wait_for_completion = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The task finished successfully with this result
    Completed(Value),
    /// The task was queued; this is its id
    Queued(String),
}

/// Awaitable completion of one submitted task
pub struct TaskHandle {
    id: String,
    done: oneshot::Receiver<Task>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the task to reach a terminal state
    pub async fn wait(self) -> Result<Value, SchedulerError> {
        let task = self.done.await.map_err(|_| SchedulerError::ShutDown)?;
        task.into_result()
    }
}

struct QueuedTask {
    work: TaskWork,
    token: CancellationToken,
    done: oneshot::Sender<Task>,
}

struct RunningTask {
    id: String,
    work: TaskWork,
    token: CancellationToken,
    done: oneshot::Sender<Task>,
}

/// Everything guarded by the queue lock
struct SchedulerState {
    queue: TaskQueue<QueuedTask>,
    running: HashMap<String, CancellationToken>,
    tasks: HashMap<String, Task>,
}

struct Inner {
    max_concurrent: usize,
    poll_interval: Duration,
    bus: Arc<EventBus>,
    errors: Arc<ErrorHandling>,
    capabilities: CapabilityRegistry,
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
    state: Mutex<SchedulerState>,
    wake: Notify,
    shutdown: CancellationToken,
}

pub struct TaskScheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Build a scheduler. Workers are not running until [`TaskScheduler::start`].
    pub fn new(
        config: &SchedulerConfig,
        bus: Arc<EventBus>,
        errors: Arc<ErrorHandling>,
        capabilities: CapabilityRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: config.max_concurrent_tasks.max(1),
                poll_interval: config.poll_interval(),
                bus,
                errors,
                capabilities,
                agents: RwLock::new(HashMap::new()),
                state: Mutex::new(SchedulerState {
                    queue: TaskQueue::new(),
                    running: HashMap::new(),
                    tasks: HashMap::new(),
                }),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.inner.capabilities
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() || self.inner.shutdown.is_cancelled() {
            return;
        }

        for worker_id in 0..self.inner.max_concurrent {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                inner.worker_loop(worker_id).await;
            }));
        }
        tracing::info!("Task scheduler started with {} workers", self.inner.max_concurrent);
    }

    /// Stop the pool: pending tasks are cancelled, running tokens fire, and
    /// workers exit once their current task returns.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let (pending, running_tokens) = {
            let mut state = self.inner.lock_state();
            let pending = state.queue.drain();
            let tokens: Vec<CancellationToken> = state.running.values().cloned().collect();
            (pending, tokens)
        };
        for token in running_tokens {
            token.cancel();
        }
        for (id, job) in pending {
            self.inner.finish_cancelled(&id, job).await;
        }

        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Scheduler worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Task scheduler stopped");
    }

    // ========================================================================
    // Agents
    // ========================================================================

    /// Create an in-process agent, loading its capability modules by name
    pub async fn create_agent(&self, config: AgentConfig) -> Result<Arc<AgentHandle>, SchedulerError> {
        if self.inner.read_agents().contains_key(&config.name) {
            return Err(SchedulerError::AgentExists(config.name));
        }

        let handle = Arc::new(AgentHandle::build(config, &self.inner.capabilities).await);

        let mut agents = self
            .inner
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if agents.contains_key(handle.name()) {
            return Err(SchedulerError::AgentExists(handle.name().to_string()));
        }
        agents.insert(handle.name().to_string(), Arc::clone(&handle));
        drop(agents);

        tracing::info!(
            "Agent {} created with modules {:?}",
            handle.name(),
            handle.info().modules
        );
        Ok(handle)
    }

    pub fn get_agent(&self, name: &str) -> Option<Arc<AgentHandle>> {
        self.inner.read_agents().get(name).cloned()
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .inner
            .read_agents()
            .values()
            .map(|a| a.info().clone())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Remove an agent and run its modules' cleanup. Queued tasks still run.
    pub async fn remove_agent(&self, name: &str) -> Result<(), SchedulerError> {
        let handle = self
            .inner
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| SchedulerError::AgentNotFound(name.to_string()))?;

        handle.cleanup().await;
        tracing::info!("Agent {} removed", name);
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Queue a description for an agent and optionally wait for its result
    pub async fn execute_task(
        &self,
        agent_name: &str,
        description: &str,
        options: ExecuteOptions,
    ) -> Result<TaskOutcome, SchedulerError> {
        let handle = self.submit(agent_name, description, options.priority).await?;
        if options.wait_for_completion {
            handle.wait().await.map(TaskOutcome::Completed)
        } else {
            Ok(TaskOutcome::Queued(handle.id))
        }
    }

    /// Queue a description for an agent's modules and executor
    pub async fn submit(
        &self,
        agent_name: &str,
        description: &str,
        priority: TaskPriority,
    ) -> Result<TaskHandle, SchedulerError> {
        let agent = self
            .get_agent(agent_name)
            .ok_or_else(|| SchedulerError::AgentNotFound(agent_name.to_string()))?;

        let owned = description.to_string();
        self.submit_work(agent_name, description, priority, move |token| async move {
            agent.dispatch(&owned, token).await
        })
        .await
    }

    /// Queue an arbitrary unit of work under `agent_name`
    pub async fn submit_work<F, Fut>(
        &self,
        agent_name: &str,
        description: &str,
        priority: TaskPriority,
        work: F,
    ) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }

        let task = Task::new(generate_id("task"), agent_name, description, priority);
        let id = task.id.clone();
        let payload = task.to_payload();
        let (done_tx, done_rx) = oneshot::channel();
        let job = QueuedTask {
            work: Box::new(move |token| work(token).boxed()),
            token: CancellationToken::new(),
            done: done_tx,
        };

        self.inner.enqueue(task, job)?;

        tracing::debug!("Queued task {} for {} ({})", id, agent_name, priority);
        self.inner.publish_task_event(events::TASK_QUEUED, &id, payload).await;
        self.inner.wake.notify_one();

        Ok(TaskHandle { id, done: done_rx })
    }

    /// Cancel a task that has not been dispatched yet
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let job = self.inner.lock_state().queue.remove(task_id);
        match job {
            Some(job) => {
                self.inner.finish_cancelled(task_id, job).await;
                true
            }
            None => false,
        }
    }

    /// Fire the cancellation token of a running task. The task body decides
    /// how to react; returning [`TaskCancelled`] records it as cancelled.
    pub fn signal_cancellation(&self, task_id: &str) -> bool {
        match self.inner.lock_state().running.get(task_id) {
            Some(token) => {
                token.cancel();
                tracing::debug!("Cancellation signalled for running task {}", task_id);
                true
            }
            None => false,
        }
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.inner.lock_state().tasks.get(task_id).cloned()
    }

    /// Pending tasks in dispatch order
    pub fn get_task_queue(&self) -> Vec<Task> {
        let state = self.inner.lock_state();
        state
            .queue
            .ids()
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    pub fn get_running_tasks(&self) -> Vec<Task> {
        let state = self.inner.lock_state();
        let mut running: Vec<Task> = state
            .running
            .keys()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        running
    }

    /// Drop a terminal task's record. Pending or running tasks are kept.
    pub fn evict_task(&self, task_id: &str) -> Option<Task> {
        let mut state = self.inner.lock_state();
        match state.tasks.get(task_id) {
            Some(task) if task.status.is_terminal() => state.tasks.remove(task_id),
            _ => None,
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_agents(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<AgentHandle>>> {
        self.agents.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record and queue a task. The shutdown check happens under the state
    /// lock because `shutdown` cancels first and drains under the same lock.
    fn enqueue(&self, task: Task, job: QueuedTask) -> Result<(), SchedulerError> {
        let mut state = self.lock_state();
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        let id = task.id.clone();
        let priority = task.priority;
        state.tasks.insert(id.clone(), task);
        state.queue.push(id, priority, job);
        Ok(())
    }

    async fn publish_task_event(&self, event: &str, task_id: &str, payload: Value) {
        self.bus.publish(event, payload.clone()).await;
        self.bus
            .publish(&events::scoped(event, task_id), payload)
            .await;
    }

    async fn worker_loop(&self, worker_id: usize) {
        tracing::debug!("Scheduler worker {} started", worker_id);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.dequeue() {
                Some(job) => self.run(job).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        tracing::debug!("Scheduler worker {} stopped", worker_id);
    }

    /// Pop the head of the queue and mark it running, all under the queue lock
    fn dequeue(&self) -> Option<RunningTask> {
        let mut state = self.lock_state();
        if state.running.len() >= self.max_concurrent {
            return None;
        }
        let (id, job) = state.queue.pop()?;

        state.running.insert(id.clone(), job.token.clone());
        if let Some(task) = state.tasks.get_mut(&id) {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
        }

        Some(RunningTask {
            id,
            work: job.work,
            token: job.token,
            done: job.done,
        })
    }

    async fn run(&self, job: RunningTask) {
        let RunningTask {
            id,
            work,
            token,
            done,
        } = job;

        let started = self.lock_state().tasks.get(&id).map(Task::to_payload);
        if let Some(payload) = started {
            self.publish_task_event(events::TASK_STARTED, &id, payload).await;
        }

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| work(token))) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        let (status, result, error) = match outcome {
            Ok(Ok(value)) => (TaskStatus::Completed, Some(value), None),
            Ok(Err(e)) if e.downcast_ref::<TaskCancelled>().is_some() => {
                (TaskStatus::Cancelled, None, Some(e.to_string()))
            }
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                self.report_failure(&id, &message, Some(e)).await;
                (TaskStatus::Failed, None, Some(message))
            }
            Err(_) => {
                let message = "task panicked".to_string();
                self.report_failure(&id, &message, None).await;
                (TaskStatus::Failed, None, Some(message))
            }
        };

        let snapshot = {
            let mut state = self.lock_state();
            state.running.remove(&id);
            state.tasks.get_mut(&id).map(|task| {
                task.status = status;
                task.completed_at = Some(Utc::now());
                task.result = result;
                task.error = error;
                task.clone()
            })
        };
        let Some(snapshot) = snapshot else {
            return;
        };

        let event = match status {
            TaskStatus::Completed => events::TASK_COMPLETED,
            TaskStatus::Cancelled => events::TASK_CANCELLED,
            _ => events::TASK_FAILED,
        };
        tracing::debug!("Task {} {}", id, status);
        self.publish_task_event(event, &id, snapshot.to_payload()).await;

        // The submitter may have stopped waiting
        let _ = done.send(snapshot);
    }

    async fn report_failure(&self, task_id: &str, message: &str, original: Option<anyhow::Error>) {
        let agent_name = self
            .lock_state()
            .tasks
            .get(task_id)
            .map(|t| t.agent_name.clone())
            .unwrap_or_default();

        let mut error = self.errors.create_error(
            format!("Task {} failed: {}", task_id, message),
            Severity::Error,
            ErrorSource::Framework,
            original,
            Some(
                ErrorContext::new()
                    .with("taskId", task_id)
                    .with("agentName", agent_name),
            ),
        );
        self.errors.handle_error(&mut error).await;
    }

    async fn finish_cancelled(&self, task_id: &str, job: QueuedTask) {
        job.token.cancel();
        let snapshot = {
            let mut state = self.lock_state();
            state.tasks.get_mut(task_id).map(|task| {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                task.clone()
            })
        };
        let Some(snapshot) = snapshot else {
            return;
        };

        tracing::debug!("Task {} cancelled before dispatch", task_id);
        self.publish_task_event(events::TASK_CANCELLED, task_id, snapshot.to_payload())
            .await;
        let _ = job.done.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler(max_concurrent_tasks: usize) -> (TaskScheduler, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let errors = Arc::new(ErrorHandling::new(Arc::clone(&bus)));
        let config = SchedulerConfig {
            max_concurrent_tasks,
            poll_interval_ms: 10,
        };
        let scheduler = TaskScheduler::new(&config, Arc::clone(&bus), errors, CapabilityRegistry::new());
        (scheduler, bus)
    }

    fn record_order(order: &Arc<Mutex<Vec<String>>>, label: &str) -> impl FnOnce(CancellationToken) -> futures::future::Ready<anyhow::Result<Value>> {
        let order = Arc::clone(order);
        let label = label.to_string();
        move |_| {
            order.lock().unwrap().push(label.clone());
            futures::future::ready(Ok(Value::String(label)))
        }
    }

    #[tokio::test]
    async fn test_execute_task_waits_for_result() {
        let (scheduler, bus) = scheduler(2);
        scheduler.start();
        scheduler.create_agent(AgentConfig::new("echo")).await.unwrap();

        let completed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&completed);
        bus.subscribe(events::TASK_COMPLETED, move |_| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let outcome = scheduler
            .execute_task("echo", "say hi", ExecuteOptions::default())
            .await
            .unwrap();

        match outcome {
            TaskOutcome::Completed(value) => assert_eq!(value["description"], "say hi"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_wait_returns_task_id() {
        let (scheduler, bus) = scheduler(1);
        scheduler.create_agent(AgentConfig::new("echo")).await.unwrap();

        let outcome = scheduler
            .execute_task("echo", "later", ExecuteOptions::default().no_wait())
            .await
            .unwrap();
        let TaskOutcome::Queued(id) = outcome else {
            panic!("expected a queued task");
        };

        let (tx, rx) = oneshot::channel::<Value>();
        let tx = Mutex::new(Some(tx));
        bus.once(&events::scoped(events::TASK_COMPLETED, &id), move |data| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send((*data).clone());
            }
            async { Ok(()) }
        });

        assert_eq!(scheduler.get_task(&id).unwrap().status, TaskStatus::Pending);
        scheduler.start();

        let payload = rx.await.unwrap();
        assert_eq!(payload["id"], id.as_str());
        assert_eq!(payload["status"], "completed");
        assert_eq!(scheduler.get_task(&id).unwrap().status, TaskStatus::Completed);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let (scheduler, _) = scheduler(1);
        assert!(matches!(
            scheduler.execute_task("nobody", "x", ExecuteOptions::default()).await,
            Err(SchedulerError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_agent_rejected() {
        let (scheduler, _) = scheduler(1);
        scheduler.create_agent(AgentConfig::new("a")).await.unwrap();
        assert!(matches!(
            scheduler.create_agent(AgentConfig::new("a")).await,
            Err(SchedulerError::AgentExists(_))
        ));
        scheduler.remove_agent("a").await.unwrap();
        assert!(scheduler.agents().is_empty());
    }

    #[tokio::test]
    async fn test_running_never_exceeds_limit() {
        let (scheduler, _) = scheduler(2);
        scheduler.start();

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for i in 0..8 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let handle = scheduler
                .submit_work("load", &format!("job {}", i), TaskPriority::Normal, move |_| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::from(i))
                })
                .await
                .unwrap();
            handles.push(handle);
        }

        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert!(scheduler.get_running_tasks().is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_and_fifo_dispatch_order() {
        let (scheduler, _) = scheduler(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (label, priority) in [
            ("low-a", TaskPriority::Low),
            ("normal-a", TaskPriority::Normal),
            ("low-b", TaskPriority::Low),
            ("normal-b", TaskPriority::Normal),
            ("critical", TaskPriority::Critical),
        ] {
            handles.push(
                scheduler
                    .submit_work("a", label, priority, record_order(&order, label))
                    .await
                    .unwrap(),
            );
        }

        let queued: Vec<String> = scheduler
            .get_task_queue()
            .into_iter()
            .map(|t| t.description)
            .collect();
        assert_eq!(queued, vec!["critical", "normal-a", "normal-b", "low-a", "low-b"]);

        scheduler.start();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "normal-a", "normal-b", "low-a", "low-b"]
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_only_pending_tasks() {
        let (scheduler, bus) = scheduler(1);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&cancelled);
        bus.subscribe(events::TASK_CANCELLED, move |_| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = scheduler
            .submit_work("a", "blocker", TaskPriority::High, move |_| async move {
                let _ = release_rx.await;
                Ok(Value::Null)
            })
            .await
            .unwrap();
        let victim = scheduler
            .submit_work("a", "victim", TaskPriority::Low, |_| async { Ok(Value::Null) })
            .await
            .unwrap();

        scheduler.start();
        while scheduler.get_running_tasks().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert!(!scheduler.cancel_task(blocker.id()).await);
        assert!(scheduler.cancel_task(victim.id()).await);
        assert!(!scheduler.cancel_task(victim.id()).await);
        assert!(!scheduler.cancel_task("task_unknown").await);

        let victim_id = victim.id().to_string();
        assert!(matches!(victim.wait().await, Err(SchedulerError::TaskCancelled(_))));
        assert_eq!(scheduler.get_task(&victim_id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        let blocker_id = blocker.id().to_string();
        release_tx.send(()).unwrap();
        blocker.wait().await.unwrap();
        assert!(!scheduler.cancel_task(&blocker_id).await);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_routes_through_error_handling() {
        let (scheduler, bus) = scheduler(1);
        scheduler.start();

        let errors_seen = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors_seen);
        bus.subscribe(events::ERROR, move |data| {
            let e = Arc::clone(&e);
            async move {
                assert_eq!(data["source"], "framework");
                assert_eq!(data["severity"], "error");
                e.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let handle = scheduler
            .submit_work("a", "doomed", TaskPriority::Normal, |_| async {
                Err::<Value, _>(anyhow::anyhow!("disk on fire"))
            })
            .await
            .unwrap();
        let id = handle.id().to_string();

        match handle.wait().await {
            Err(SchedulerError::TaskFailed { message, .. }) => assert!(message.contains("disk on fire")),
            other => panic!("unexpected {:?}", other),
        }
        let task = scheduler.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completed_at.is_some());
        assert_eq!(errors_seen.load(Ordering::SeqCst), 1);

        assert!(scheduler.evict_task(&id).is_some());
        assert!(scheduler.get_task(&id).is_none());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_task_fails_without_killing_worker() {
        let (scheduler, _) = scheduler(1);
        scheduler.start();

        let handle = scheduler
            .submit_work("a", "panics", TaskPriority::Normal, |_| async {
                if true {
                    panic!("bad task");
                }
                Ok::<Value, anyhow::Error>(Value::Null)
            })
            .await
            .unwrap();
        assert!(matches!(handle.wait().await, Err(SchedulerError::TaskFailed { .. })));

        let next = scheduler
            .submit_work("a", "fine", TaskPriority::Normal, |_| async { Ok(Value::from(1)) })
            .await
            .unwrap();
        assert_eq!(next.wait().await.unwrap(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_signal_cancellation_reaches_running_task() {
        let (scheduler, _) = scheduler(1);
        scheduler.start();

        let handle = scheduler
            .submit_work("a", "long", TaskPriority::Normal, |token| async move {
                tokio::select! {
                    _ = token.cancelled() => Err(anyhow::Error::new(TaskCancelled)),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(Value::Null),
                }
            })
            .await
            .unwrap();
        let id = handle.id().to_string();

        while scheduler.get_running_tasks().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(!scheduler.signal_cancellation("task_unknown"));
        assert!(scheduler.signal_cancellation(&id));

        assert!(matches!(handle.wait().await, Err(SchedulerError::TaskCancelled(_))));
        assert_eq!(scheduler.get_task(&id).unwrap().status, TaskStatus::Cancelled);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let (scheduler, _) = scheduler(1);
        let handle = scheduler
            .submit_work("a", "never runs", TaskPriority::Normal, |_| async { Ok(Value::Null) })
            .await
            .unwrap();

        scheduler.shutdown().await;
        assert!(matches!(handle.wait().await, Err(SchedulerError::TaskCancelled(_))));
        assert!(matches!(
            scheduler
                .submit_work("a", "too late", TaskPriority::Normal, |_| async { Ok(Value::Null) })
                .await,
            Err(SchedulerError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_rejected_once_shutdown_has_drained() {
        let (scheduler, _) = scheduler(1);
        scheduler.start();
        scheduler.shutdown().await;

        // A submitter that passed the early check before shutdown ran
        let task = Task::new("task_late".to_string(), "a", "late", TaskPriority::High);
        let (done_tx, done_rx) = oneshot::channel();
        let job = QueuedTask {
            work: Box::new(|_: CancellationToken| async { Ok::<_, anyhow::Error>(Value::Null) }.boxed()),
            token: CancellationToken::new(),
            done: done_tx,
        };

        assert!(matches!(
            scheduler.inner.enqueue(task, job),
            Err(SchedulerError::ShutDown)
        ));
        assert!(scheduler.get_task_queue().is_empty());
        assert!(scheduler.get_task("task_late").is_none());

        // The rejected job's sender is gone, so a waiter is released
        let handle = TaskHandle {
            id: "task_late".to_string(),
            done: done_rx,
        };
        assert!(matches!(handle.wait().await, Err(SchedulerError::ShutDown)));
    }
}
