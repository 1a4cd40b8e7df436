//! Child process plumbing: build steps, spawning, output forwarding, termination

use crate::config::CommandConfig;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Outcome of a synchronous install/build step
pub(crate) struct StepOutput {
    pub status: ExitStatus,
    pub stderr: String,
}

fn command(spec: &CommandConfig, dir: &Path) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).current_dir(dir);
    cmd
}

/// True when the program can be found on PATH. Explicit paths are left to spawn.
pub(crate) fn is_resolvable(program: &str) -> bool {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return true;
    }
    which::which(program).is_ok()
}

/// Run a step to completion inside `dir`
pub(crate) async fn run_step(spec: &CommandConfig, dir: &Path) -> std::io::Result<StepOutput> {
    let output = command(spec, dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    Ok(StepOutput {
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Spawn the long-running agent process with its output forwarded to tracing
pub(crate) fn spawn_agent(spec: &CommandConfig, dir: &Path, agent_id: &str) -> std::io::Result<Child> {
    let mut child = command(spec, dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, agent_id.to_string(), false);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, agent_id.to_string(), true);
    }
    Ok(child)
}

fn forward_lines<R>(stream: R, agent_id: String, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => tracing::warn!(agent = %agent_id, "{}", line),
                Ok(Some(line)) => tracing::info!(agent = %agent_id, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(agent = %agent_id, "Output stream closed: {}", e);
                    break;
                }
            }
        }
    });
}

/// Send SIGTERM to a process id
#[cfg(unix)]
pub(crate) fn send_terminate(pid: u32) -> std::io::Result<()> {
    // SAFETY: plain FFI call with no pointers involved
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Ask the process to exit, then kill it if it is still alive after `grace`
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            if let Err(e) = send_terminate(pid) {
                tracing::debug!("SIGTERM to {} failed: {}", pid, e);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!("Waiting for agent process failed: {}", e);
            None
        }
        Err(_) => {
            tracing::warn!("Agent process ignored termination, killing it");
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill agent process: {}", e);
            }
            child.try_wait().ok().flatten()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_run_step_reports_status_and_stderr() {
        let dir = tempdir().unwrap();
        let ok = run_step(&CommandConfig::new("sh", &["-c", "touch built"]), dir.path())
            .await
            .unwrap();
        assert!(ok.status.success());
        assert!(dir.path().join("built").exists());

        let failed = run_step(
            &CommandConfig::new("sh", &["-c", "echo nope >&2; exit 4"]),
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(failed.status.code(), Some(4));
        assert_eq!(failed.stderr, "nope");
    }

    #[tokio::test]
    async fn test_terminate_stops_process() {
        let dir = tempdir().unwrap();
        let mut child =
            spawn_agent(&CommandConfig::new("sleep", &["30"]), dir.path(), "sleeper").unwrap();

        let status = terminate(&mut child, Duration::from_secs(5)).await;
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }

    #[test]
    fn test_is_resolvable() {
        assert!(is_resolvable("sh"));
        assert!(!is_resolvable("agent-mesh-no-such-program"));
        assert!(is_resolvable("./bin/run"));
    }
}
