//! Control channel of the process that owns a storage root
//!
//! The mailbox database can be open in one process at a time, so a supervising
//! `agent-mesh start` would otherwise lock every other invocation out. The
//! owner serves a Unix socket under the storage root instead; other processes
//! that find the storage locked send it the same requests they would have run
//! locally.
//!
//! Frames are a 4-byte little-endian length followed by a JSON body of at
//! most 1MB. Every request gets exactly one [`ControlResponse`].

use crate::mailbox::{MessageDraft, MessageType, SYSTEM_SENDER};
use crate::registry::{Agent, AgentStatus};
use crate::scheduler::{AgentConfig, ExecuteOptions, TaskOutcome, TaskPriority};
use crate::MeshRuntime;
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    ListAgents {
        status: Option<AgentStatus>,
    },
    RegisterAgent {
        agent: Agent,
    },
    SetStatus {
        id: String,
        status: AgentStatus,
    },
    SendMessage {
        from: String,
        to: String,
        message_type: MessageType,
        subject: String,
        #[serde(default)]
        content: Value,
    },
    Inbox {
        agent: String,
        #[serde(default)]
        unread: bool,
    },
    MarkRead {
        agent: String,
        message_id: String,
    },
    Reply {
        message_id: String,
        from: String,
        content: Value,
        message_type: Option<MessageType>,
    },
    /// `path` is resolved by the caller; the owner may run elsewhere
    ShareFile {
        from: String,
        to: String,
        path: PathBuf,
        #[serde(default)]
        description: String,
    },
    CreateTask {
        creator: Option<String>,
        assignees: Vec<String>,
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        data: Value,
    },
    UpdateTask {
        task_id: String,
        agent: String,
        status: String,
        #[serde(default)]
        message: String,
    },
    ShowTask {
        task_id: String,
    },
    StartAgent {
        id: String,
    },
    StopAgent {
        id: String,
    },
    RestartAgent {
        id: String,
    },
    RunTask {
        agent: String,
        description: String,
        #[serde(default)]
        priority: TaskPriority,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub action: String,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    fn from_result(action: String, result: anyhow::Result<Value>) -> Self {
        match result {
            Ok(data) => Self {
                action,
                success: true,
                data,
                error: None,
            },
            Err(e) => Self {
                action,
                success: false,
                data: Value::Null,
                error: Some(format!("{:#}", e)),
            },
        }
    }
}

/// Socket served by the process that holds `root`
pub fn socket_path(root: &Path) -> PathBuf {
    root.join("run").join("control.sock")
}

// ============================================================================
// Execution
// ============================================================================

/// Run one request against a runtime. `RunTask` needs the worker pool to be
/// started.
pub async fn execute(runtime: &MeshRuntime, request: ControlRequest) -> anyhow::Result<Value> {
    let mailbox = runtime.mailbox();
    let supervisor = runtime.supervisor();

    let data = match request {
        ControlRequest::ListAgents { status } => {
            let agents = match status {
                Some(status) => runtime.registry().by_status(status)?,
                None => runtime.registry().list()?,
            };
            serde_json::to_value(agents)?
        }

        ControlRequest::RegisterAgent { agent } => {
            mailbox.register_agent(&agent)?;
            serde_json::to_value(agent)?
        }

        ControlRequest::SetStatus { id, status } => {
            serde_json::to_value(mailbox.update_agent_status(&id, status)?)?
        }

        ControlRequest::SendMessage {
            from,
            to,
            message_type,
            subject,
            content,
        } => {
            let draft = MessageDraft::new(from, to, message_type, subject).with_content(content);
            json!({ "id": mailbox.send_message(draft)? })
        }

        ControlRequest::Inbox { agent, unread } => {
            let messages = if unread {
                mailbox.get_unread_messages_for_agent(&agent)?
            } else {
                mailbox.get_messages_for_agent(&agent)?
            };
            serde_json::to_value(messages)?
        }

        ControlRequest::MarkRead { agent, message_id } => {
            json!({ "newlyRead": mailbox.mark_message_as_read(&message_id, &agent)? })
        }

        ControlRequest::Reply {
            message_id,
            from,
            content,
            message_type,
        } => {
            let id = mailbox.reply_to_message(&message_id, &from, content, message_type)?;
            json!({ "id": id })
        }

        ControlRequest::ShareFile {
            from,
            to,
            path,
            description,
        } => {
            let shared = mailbox.share_file(&from, &to, &path, &description).await?;
            json!({ "messageId": shared.message_id, "path": shared.path })
        }

        ControlRequest::CreateTask {
            creator,
            assignees,
            name,
            description,
            data,
        } => {
            let id = match creator {
                Some(creator) => supervisor.create_collaborative_task(
                    &creator,
                    &assignees,
                    &name,
                    &description,
                    data,
                )?,
                None if assignees.len() == 1 => {
                    supervisor.create_task(&assignees[0], &name, &description, data)?
                }
                None => mailbox.create_shared_task(
                    SYSTEM_SENDER,
                    &assignees,
                    &name,
                    &description,
                    data,
                )?,
            };
            json!({ "id": id })
        }

        ControlRequest::UpdateTask {
            task_id,
            agent,
            status,
            message,
        } => {
            let notified = mailbox.update_task_status(&agent, &task_id, &status, &message)?;
            json!({ "taskId": task_id, "notified": notified })
        }

        ControlRequest::ShowTask { task_id } => {
            let view = mailbox
                .get_shared_task(&task_id)?
                .ok_or_else(|| anyhow!("shared task {} not found", task_id))?;
            serde_json::to_value(view)?
        }

        ControlRequest::StartAgent { id } => {
            supervisor.start_agent(&id).await?;
            json!({ "id": id, "pid": supervisor.pid(&id) })
        }

        ControlRequest::StopAgent { id } => {
            let stopped = supervisor.stop_agent(&id).await?;
            json!({ "id": id, "stopped": stopped })
        }

        ControlRequest::RestartAgent { id } => {
            supervisor.restart_agent(&id).await?;
            json!({ "id": id, "pid": supervisor.pid(&id) })
        }

        ControlRequest::RunTask {
            agent,
            description,
            priority,
        } => {
            let scheduler = runtime.scheduler();
            if scheduler.get_agent(&agent).is_none() {
                scheduler.create_agent(AgentConfig::new(&agent)).await?;
            }
            let outcome = scheduler
                .execute_task(&agent, &description, ExecuteOptions::default().priority(priority))
                .await?;
            match outcome {
                TaskOutcome::Completed(result) => json!({ "status": "completed", "result": result }),
                TaskOutcome::Queued(id) => json!({ "status": "queued", "id": id }),
            }
        }
    };
    Ok(data)
}

// ============================================================================
// Framing
// ============================================================================

pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, body: &[u8]) -> io::Result<()> {
    if body.is_empty() || body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes is out of range", body.len()),
        ));
    }
    let len = (body.len() as u32).to_le_bytes();
    stream.write_all(&len).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// `None` when the peer closed the connection between frames
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length: {}", len),
        ));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Parse and run one frame. Malformed requests get a failed response rather
/// than closing the connection.
async fn handle_frame(runtime: &MeshRuntime, body: &[u8]) -> ControlResponse {
    let raw: Value = match serde_json::from_slice(body) {
        Ok(raw) => raw,
        Err(e) => {
            return ControlResponse::from_result("unknown".to_string(), Err(e.into()));
        }
    };
    let action = raw
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let result = match serde_json::from_value::<ControlRequest>(raw) {
        Ok(request) => {
            tracing::debug!("Control request: {}", action);
            execute(runtime, request).await
        }
        Err(e) => Err(anyhow!("invalid request: {}", e)),
    };
    if let Err(e) = &result {
        tracing::warn!("Control request {} failed: {:#}", action, e);
    }
    ControlResponse::from_result(action, result)
}

// ============================================================================
// Server and client
// ============================================================================

#[cfg(unix)]
pub use server::{serve, ControlServer};

#[cfg(unix)]
mod server {
    use super::*;
    use std::sync::Arc;
    use tokio::net::{UnixListener, UnixStream};
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    pub struct ControlServer {
        path: PathBuf,
        shutdown: CancellationToken,
        accept: JoinHandle<()>,
    }

    impl ControlServer {
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Stop accepting connections and remove the socket file
        pub async fn stop(self) {
            self.shutdown.cancel();
            if let Err(e) = self.accept.await {
                tracing::error!("Control listener ended abnormally: {}", e);
            }
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
                }
            }
            tracing::info!("Control channel closed");
        }
    }

    /// Serve `runtime` on the socket under its storage root. The caller holds
    /// the storage lock, so a socket file left there is stale.
    pub fn serve(runtime: Arc<MeshRuntime>) -> io::Result<ControlServer> {
        let path = socket_path(runtime.mailbox().root());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&path)?;
        tracing::info!("Control channel listening on {}", path.display());

        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(listener, runtime, shutdown.clone()));
        Ok(ControlServer {
            path,
            shutdown,
            accept,
        })
    }

    async fn accept_loop(listener: UnixListener, runtime: Arc<MeshRuntime>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(stream, Arc::clone(&runtime)));
                    }
                    Err(e) => {
                        tracing::warn!("Control accept failed: {}", e);
                    }
                },
            }
        }
    }

    async fn handle_connection(mut stream: UnixStream, runtime: Arc<MeshRuntime>) {
        loop {
            let body = match read_frame(&mut stream).await {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Dropping control connection: {}", e);
                    break;
                }
            };

            let response = handle_frame(&runtime, &body).await;
            let json = match serde_json::to_vec(&response) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to encode control response: {}", e);
                    break;
                }
            };
            if let Err(e) = write_frame(&mut stream, &json).await {
                tracing::debug!("Control client went away: {}", e);
                break;
            }
        }
    }
}

/// Send one request to the process serving `root` and return its data
#[cfg(unix)]
pub async fn send(root: &Path, request: &ControlRequest) -> anyhow::Result<Value> {
    let path = socket_path(root);
    let mut stream = tokio::net::UnixStream::connect(&path)
        .await
        .with_context(|| format!("no control channel at {}", path.display()))?;

    write_frame(&mut stream, &serde_json::to_vec(request)?).await?;
    let body = read_frame(&mut stream)
        .await?
        .ok_or_else(|| anyhow!("control channel closed before responding"))?;

    let response: ControlResponse = serde_json::from_slice(&body)?;
    if !response.success {
        bail!(response
            .error
            .unwrap_or_else(|| format!("{} failed", response.action)));
    }
    Ok(response.data)
}

#[cfg(not(unix))]
pub async fn send(root: &Path, _request: &ControlRequest) -> anyhow::Result<Value> {
    bail!(
        "storage {} is in use and control connections need Unix sockets",
        root.display()
    )
}
