//! Agent process supervisor
//!
//! Starting an agent makes sure its project is installed and built, spawns
//! the run command in the agent's directory and marks it `busy`. A monitor
//! task owns the child; when the process exits for any reason the agent is
//! removed from the running set and marked `offline`. Explicit stops go
//! through the same monitor so the child is always reaped in one place.
//!
//! An agent's slot is reserved before the install and build steps run, so
//! concurrent starts of the same id spawn at most one process.

mod process;

use crate::config::{CommandConfig, SupervisorConfig};
use crate::mailbox::{Mailbox, MailboxError, SYSTEM_SENDER};
use crate::registry::{Agent, AgentStatus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {0} has no project path")]
    MissingPath(String),

    #[error("Agent {agent}: project descriptor {} not found", path.display())]
    MissingDescriptor { agent: String, path: PathBuf },

    #[error("Program '{0}' not found on PATH")]
    ProgramNotFound(String),

    #[error("Install step `{command}` failed for {agent}: {detail}")]
    InstallFailed {
        agent: String,
        command: String,
        detail: String,
    },

    #[error("Build step `{command}` failed for {agent}: {detail}")]
    BuildFailed {
        agent: String,
        command: String,
        detail: String,
    },

    #[error("Failed to spawn agent {agent}: {source}")]
    Spawn {
        agent: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

struct RunningAgent {
    instance: Uuid,
    pid: Option<u32>,
    stop: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

enum Slot {
    /// Installing or building; no process yet
    Starting,
    Running(RunningAgent),
}

type RunningMap = Arc<Mutex<HashMap<String, Slot>>>;

/// A claimed `Starting` slot. Dropping it frees the slot unless a process
/// has been recorded there in the meantime.
struct Reservation<'a> {
    running: &'a RunningMap,
    agent_id: &'a str,
}

impl<'a> Reservation<'a> {
    fn claim(running: &'a RunningMap, agent_id: &'a str) -> Option<Self> {
        let mut slots = lock(running);
        if slots.contains_key(agent_id) {
            return None;
        }
        slots.insert(agent_id.to_string(), Slot::Starting);
        Some(Self { running, agent_id })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut slots = lock(self.running);
        if matches!(slots.get(self.agent_id), Some(Slot::Starting)) {
            slots.remove(self.agent_id);
        }
    }
}

/// Registry metadata key holding the pid of the agent's current process
pub const PID_METADATA_KEY: &str = "pid";

fn record_pid(mailbox: &Mailbox, agent_id: &str, pid: Option<u32>) {
    if let Err(e) = mailbox
        .registry()
        .update_metadata(agent_id, PID_METADATA_KEY, json!(pid))
    {
        tracing::warn!("Failed to record pid for {}: {}", agent_id, e);
    }
}

fn lock(running: &RunningMap) -> MutexGuard<'_, HashMap<String, Slot>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    mailbox: Arc<Mailbox>,
    running: RunningMap,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, mailbox: Arc<Mailbox>) -> Self {
        Self {
            config,
            mailbox,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        matches!(lock(&self.running).get(agent_id), Some(Slot::Running(_)))
    }

    pub fn running_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.running)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn pid(&self, agent_id: &str) -> Option<u32> {
        match lock(&self.running).get(agent_id) {
            Some(Slot::Running(r)) => r.pid,
            _ => None,
        }
    }

    fn require_agent(&self, agent_id: &str) -> SupervisorResult<Agent> {
        self.mailbox
            .registry()
            .get(agent_id)?
            .ok_or_else(|| SupervisorError::AgentNotFound(agent_id.to_string()))
    }

    fn check_program(spec: &CommandConfig) -> SupervisorResult<()> {
        if process::is_resolvable(&spec.program) {
            Ok(())
        } else {
            Err(SupervisorError::ProgramNotFound(spec.program.clone()))
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Install, build and spawn the agent. A running agent is left alone.
    pub async fn start_agent(&self, agent_id: &str) -> SupervisorResult<()> {
        let Some(_reservation) = Reservation::claim(&self.running, agent_id) else {
            tracing::warn!("Agent {} is already running or starting", agent_id);
            return Ok(());
        };

        let agent = self.require_agent(agent_id)?;
        let dir = agent
            .path
            .clone()
            .ok_or_else(|| SupervisorError::MissingPath(agent_id.to_string()))?;

        let descriptor = dir.join(&self.config.descriptor_file);
        if !descriptor.is_file() {
            return Err(SupervisorError::MissingDescriptor {
                agent: agent_id.to_string(),
                path: descriptor,
            });
        }

        let needs_install = !dir.join(&self.config.dependency_dir).exists();
        let needs_build = !dir.join(&self.config.build_dir).exists();

        if needs_install {
            Self::check_program(&self.config.install)?;
        }
        if needs_build {
            Self::check_program(&self.config.build)?;
        }
        Self::check_program(&self.config.run)?;

        if needs_install {
            tracing::info!("Installing dependencies for {}: {}", agent_id, self.config.install);
            self.run_step(agent_id, &dir, &self.config.install, |command, detail| {
                SupervisorError::InstallFailed {
                    agent: agent_id.to_string(),
                    command,
                    detail,
                }
            })
            .await?;
        }

        if needs_build {
            tracing::info!("Building {}: {}", agent_id, self.config.build);
            self.run_step(agent_id, &dir, &self.config.build, |command, detail| {
                SupervisorError::BuildFailed {
                    agent: agent_id.to_string(),
                    command,
                    detail,
                }
            })
            .await?;
        }

        let mut child = process::spawn_agent(&self.config.run, &dir, agent_id).map_err(|source| {
            SupervisorError::Spawn {
                agent: agent_id.to_string(),
                source,
            }
        })?;
        let pid = child.id();

        if let Err(e) = self.mailbox.update_agent_status(agent_id, AgentStatus::Busy) {
            let _ = process::terminate(&mut child, self.config.stop_grace()).await;
            return Err(e.into());
        }

        record_pid(&self.mailbox, agent_id, pid);

        let instance = Uuid::new_v4();
        let (stop_tx, stop_rx) = oneshot::channel();
        {
            // Hold the lock until the entry exists so a fast exit still finds it
            let mut running = lock(&self.running);
            let monitor = tokio::spawn(monitor(
                child,
                stop_rx,
                agent_id.to_string(),
                instance,
                Arc::clone(&self.running),
                Arc::clone(&self.mailbox),
                self.config.stop_grace(),
            ));
            running.insert(
                agent_id.to_string(),
                Slot::Running(RunningAgent {
                    instance,
                    pid,
                    stop: stop_tx,
                    monitor,
                }),
            );
        }

        tracing::info!("Agent {} started (pid {:?})", agent_id, pid);
        Ok(())
    }

    async fn run_step<F>(
        &self,
        agent_id: &str,
        dir: &Path,
        spec: &CommandConfig,
        failed: F,
    ) -> SupervisorResult<()>
    where
        F: FnOnce(String, String) -> SupervisorError,
    {
        let detail = match process::run_step(spec, dir).await {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) if output.stderr.is_empty() => output.status.to_string(),
            Ok(output) => format!("{}: {}", output.status, output.stderr),
            Err(e) => e.to_string(),
        };

        tracing::error!("Agent {}: `{}` failed: {}", agent_id, spec, detail);
        Err(failed(spec.to_string(), detail))
    }

    /// Terminate a running agent and mark it offline.
    /// Returns false (with a warning) if it was not running.
    pub async fn stop_agent(&self, agent_id: &str) -> SupervisorResult<bool> {
        let entry = {
            let mut running = lock(&self.running);
            match running.remove(agent_id) {
                Some(Slot::Running(entry)) => entry,
                Some(Slot::Starting) => {
                    running.insert(agent_id.to_string(), Slot::Starting);
                    tracing::warn!("Agent {} is still starting", agent_id);
                    return Ok(false);
                }
                None => {
                    tracing::warn!("Agent {} is not running", agent_id);
                    return Ok(false);
                }
            }
        };

        let _ = entry.stop.send(());
        if let Err(e) = entry.monitor.await {
            tracing::error!("Monitor for {} ended abnormally: {}", agent_id, e);
        }

        record_pid(&self.mailbox, agent_id, None);
        self.mailbox
            .update_agent_status(agent_id, AgentStatus::Offline)?;
        tracing::info!("Agent {} stopped", agent_id);
        Ok(true)
    }

    /// Clear agents left behind by a supervisor that exited without
    /// cleaning up. Holding the storage root open means no other supervisor
    /// is alive for it, so every recorded pid is stale here.
    pub fn recover_stale(&self) -> SupervisorResult<Vec<String>> {
        let mut recovered = Vec::new();
        for agent in self.mailbox.registry().list()? {
            let Some(pid) = agent.metadata.get(PID_METADATA_KEY).and_then(Value::as_u64) else {
                continue;
            };
            if self.is_running(&agent.id) {
                continue;
            }

            tracing::warn!(
                "Agent {} (pid {}) was left by a previous supervisor, marking it offline",
                agent.id,
                pid
            );
            record_pid(&self.mailbox, &agent.id, None);
            if agent.status != AgentStatus::Offline {
                self.mailbox
                    .update_agent_status(&agent.id, AgentStatus::Offline)?;
            }
            recovered.push(agent.id);
        }
        Ok(recovered)
    }

    pub async fn restart_agent(&self, agent_id: &str) -> SupervisorResult<()> {
        if self.is_running(agent_id) {
            self.stop_agent(agent_id).await?;
        }
        self.start_agent(agent_id).await
    }

    /// Stop every running agent, continuing past individual failures
    pub async fn stop_all(&self) {
        for agent_id in self.running_agents() {
            if let Err(e) = self.stop_agent(&agent_id).await {
                tracing::error!("Failed to stop {}: {}", agent_id, e);
            }
        }
    }

    // ========================================================================
    // Shared tasks
    // ========================================================================

    /// Assign a shared task from the system to one registered agent
    pub fn create_task(
        &self,
        assignee: &str,
        name: &str,
        description: &str,
        data: Value,
    ) -> SupervisorResult<String> {
        self.require_agent(assignee)?;
        Ok(self.mailbox.create_shared_task(
            SYSTEM_SENDER,
            &[assignee.to_string()],
            name,
            description,
            data,
        )?)
    }

    /// Create a shared task between registered agents
    pub fn create_collaborative_task(
        &self,
        creator: &str,
        assignees: &[String],
        name: &str,
        description: &str,
        data: Value,
    ) -> SupervisorResult<String> {
        self.require_agent(creator)?;
        for assignee in assignees {
            self.require_agent(assignee)?;
        }
        Ok(self
            .mailbox
            .create_shared_task(creator, assignees, name, description, data)?)
    }
}

/// Owns the child until it exits or a stop is requested
async fn monitor(
    mut child: Child,
    stop: oneshot::Receiver<()>,
    agent_id: String,
    instance: Uuid,
    running: RunningMap,
    mailbox: Arc<Mailbox>,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) if status.success() => tracing::info!("Agent {} exited", agent_id),
                Ok(status) => tracing::warn!("Agent {} exited unexpectedly: {}", agent_id, status),
                Err(e) => tracing::error!("Agent {} process error: {}", agent_id, e),
            }

            let removed = {
                let mut running = lock(&running);
                if matches!(running.get(&agent_id), Some(Slot::Running(r)) if r.instance == instance) {
                    running.remove(&agent_id);
                    true
                } else {
                    false
                }
            };
            if removed {
                record_pid(&mailbox, &agent_id, None);
                if let Err(e) = mailbox.update_agent_status(&agent_id, AgentStatus::Offline) {
                    tracing::error!("Failed to mark {} offline: {}", agent_id, e);
                }
            }
        }
        _ = stop => {
            let status = process::terminate(&mut child, grace).await;
            tracing::debug!("Agent {} terminated: {:?}", agent_id, status);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn sh(script: &str) -> CommandConfig {
        CommandConfig::new("sh", &["-c", script])
    }

    fn config(run: CommandConfig) -> SupervisorConfig {
        SupervisorConfig {
            descriptor_file: "agent.toml".to_string(),
            dependency_dir: "deps".to_string(),
            build_dir: "build".to_string(),
            stop_grace_ms: 2000,
            install: sh("mkdir deps"),
            build: sh("mkdir build"),
            run,
        }
    }

    struct Fixture {
        _dir: TempDir,
        project: PathBuf,
        mailbox: Arc<Mailbox>,
    }

    fn fixture(agent_id: &str) -> Fixture {
        let dir = tempdir().unwrap();
        let project = dir.path().join("projects").join(agent_id);
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("agent.toml"), "name = 'x'").unwrap();

        let mailbox = Arc::new(Mailbox::open(&dir.path().join("mesh")).unwrap());
        mailbox
            .register_agent(&Agent::new(agent_id, agent_id, "service").with_path(&project))
            .unwrap();

        Fixture {
            _dir: dir,
            project,
            mailbox,
        }
    }

    fn status(mailbox: &Mailbox, id: &str) -> AgentStatus {
        mailbox.registry().get(id).unwrap().unwrap().status
    }

    async fn wait_until_stopped(supervisor: &ProcessSupervisor, id: &str) {
        for _ in 0..200 {
            if !supervisor.is_running(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent {} never stopped", id);
    }

    #[tokio::test]
    async fn test_install_build_run_and_stop() {
        let fx = fixture("x");
        let supervisor = ProcessSupervisor::new(config(sh("exec sleep 30")), Arc::clone(&fx.mailbox));

        supervisor.start_agent("x").await.unwrap();

        assert!(fx.project.join("deps").is_dir());
        assert!(fx.project.join("build").is_dir());
        assert!(supervisor.is_running("x"));
        assert!(supervisor.pid("x").is_some());
        assert_eq!(supervisor.running_agents(), vec!["x"]);
        assert_eq!(status(&fx.mailbox, "x"), AgentStatus::Busy);

        // Starting again is a no-op
        supervisor.start_agent("x").await.unwrap();

        assert!(supervisor.stop_agent("x").await.unwrap());
        assert!(!supervisor.is_running("x"));
        assert_eq!(status(&fx.mailbox, "x"), AgentStatus::Offline);
        assert!(!supervisor.stop_agent("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_build_failure_leaves_agent_offline() {
        let fx = fixture("x");
        std::fs::create_dir(fx.project.join("deps")).unwrap();
        let mut cfg = config(sh("exec sleep 30"));
        cfg.build = sh("echo compile error >&2; exit 2");
        let supervisor = ProcessSupervisor::new(cfg, Arc::clone(&fx.mailbox));

        let err = supervisor.start_agent("x").await.unwrap_err();
        match err {
            SupervisorError::BuildFailed { agent, detail, .. } => {
                assert_eq!(agent, "x");
                assert!(detail.contains("compile error"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!supervisor.is_running("x"));
        assert_eq!(status(&fx.mailbox, "x"), AgentStatus::Offline);
    }

    #[tokio::test]
    async fn test_install_failure_aborts_start() {
        let fx = fixture("x");
        let mut cfg = config(sh("exec sleep 30"));
        cfg.install = sh("exit 1");
        let supervisor = ProcessSupervisor::new(cfg, Arc::clone(&fx.mailbox));

        assert!(matches!(
            supervisor.start_agent("x").await,
            Err(SupervisorError::InstallFailed { .. })
        ));
        assert!(!fx.project.join("build").exists());
        assert!(!supervisor.is_running("x"));
    }

    #[tokio::test]
    async fn test_crash_marks_agent_offline() {
        let fx = fixture("x");
        let supervisor = ProcessSupervisor::new(config(sh("sleep 0.1; exit 3")), Arc::clone(&fx.mailbox));

        supervisor.start_agent("x").await.unwrap();
        wait_until_stopped(&supervisor, "x").await;

        for _ in 0..100 {
            if status(&fx.mailbox, "x") == AgentStatus::Offline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status(&fx.mailbox, "x"), AgentStatus::Offline);
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let fx = fixture("x");
        let supervisor = ProcessSupervisor::new(config(sh("exec sleep 30")), Arc::clone(&fx.mailbox));

        supervisor.start_agent("x").await.unwrap();
        let first = supervisor.pid("x");
        supervisor.restart_agent("x").await.unwrap();

        assert!(supervisor.is_running("x"));
        assert_ne!(supervisor.pid("x"), first);
        assert_eq!(status(&fx.mailbox, "x"), AgentStatus::Busy);

        supervisor.stop_all().await;
        assert!(supervisor.running_agents().is_empty());
    }

    #[tokio::test]
    async fn test_start_preconditions() {
        let fx = fixture("x");
        let supervisor = ProcessSupervisor::new(config(sh("true")), Arc::clone(&fx.mailbox));

        assert!(matches!(
            supervisor.start_agent("nobody").await,
            Err(SupervisorError::AgentNotFound(_))
        ));

        fx.mailbox
            .register_agent(&Agent::new("nowhere", "nowhere", "service"))
            .unwrap();
        assert!(matches!(
            supervisor.start_agent("nowhere").await,
            Err(SupervisorError::MissingPath(_))
        ));

        std::fs::remove_file(fx.project.join("agent.toml")).unwrap();
        assert!(matches!(
            supervisor.start_agent("x").await,
            Err(SupervisorError::MissingDescriptor { .. })
        ));

        std::fs::write(fx.project.join("agent.toml"), "").unwrap();
        let missing = ProcessSupervisor::new(
            config(CommandConfig::new("agent-mesh-no-such-program", &[])),
            Arc::clone(&fx.mailbox),
        );
        assert!(matches!(
            missing.start_agent("x").await,
            Err(SupervisorError::ProgramNotFound(p)) if p == "agent-mesh-no-such-program"
        ));
        assert!(!fx.project.join("deps").exists());
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_one_process() {
        let fx = fixture("x");
        let mut cfg = config(sh("exec sleep 30"));
        cfg.build = sh("sleep 0.3; echo built >> builds.log; mkdir build");
        let supervisor = ProcessSupervisor::new(cfg, Arc::clone(&fx.mailbox));

        let (first, second) = tokio::join!(supervisor.start_agent("x"), supervisor.start_agent("x"));
        first.unwrap();
        second.unwrap();

        let builds = std::fs::read_to_string(fx.project.join("builds.log")).unwrap();
        assert_eq!(builds.lines().count(), 1);
        assert_eq!(supervisor.running_agents(), vec!["x"]);

        let pid = supervisor.pid("x");
        assert!(pid.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(supervisor.is_running("x"));
        assert_eq!(supervisor.pid("x"), pid);

        supervisor.stop_all().await;
        assert!(supervisor.running_agents().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_releases_slot() {
        let fx = fixture("x");
        let mut cfg = config(sh("exec sleep 30"));
        cfg.build = sh("exit 1");
        let supervisor = ProcessSupervisor::new(cfg, Arc::clone(&fx.mailbox));

        assert!(supervisor.start_agent("x").await.is_err());
        assert!(lock(&supervisor.running).is_empty());
        // A later attempt runs the steps again instead of being treated as a duplicate
        assert!(supervisor.start_agent("x").await.is_err());
    }

    #[tokio::test]
    async fn test_recover_stale_clears_previous_owner() {
        let fx = fixture("x");
        fx.mailbox
            .register_agent(&Agent::new("y", "y", "service"))
            .unwrap();
        fx.mailbox
            .registry()
            .update_metadata("x", PID_METADATA_KEY, json!(4242))
            .unwrap();
        fx.mailbox.update_agent_status("x", AgentStatus::Busy).unwrap();
        let supervisor = ProcessSupervisor::new(config(sh("true")), Arc::clone(&fx.mailbox));

        assert_eq!(supervisor.recover_stale().unwrap(), vec!["x"]);

        let agent = fx.mailbox.registry().get("x").unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(agent.metadata[PID_METADATA_KEY].is_null());
        assert!(supervisor.recover_stale().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_task_creation_validates_registry() {
        let fx = fixture("a");
        fx.mailbox
            .register_agent(&Agent::new("b", "b", "service"))
            .unwrap();
        let supervisor = ProcessSupervisor::new(config(sh("true")), Arc::clone(&fx.mailbox));

        let tid = supervisor
            .create_task("b", "Index", "index the docs", Value::Null)
            .unwrap();
        let view = fx.mailbox.get_shared_task(&tid).unwrap().unwrap();
        assert_eq!(view.task.creator, SYSTEM_SENDER);
        assert_eq!(view.task.assignees, vec!["b"]);

        supervisor
            .create_collaborative_task("a", &["b".to_string()], "Pair", "", Value::Null)
            .unwrap();
        assert!(matches!(
            supervisor.create_collaborative_task("a", &["b".into(), "zed".into()], "Trio", "", Value::Null),
            Err(SupervisorError::AgentNotFound(id)) if id == "zed"
        ));
        assert!(matches!(
            supervisor.create_task("zed", "Solo", "", Value::Null),
            Err(SupervisorError::AgentNotFound(_))
        ));
    }
}
