//! Durable agent mailbox
//!
//! Every message is written to its recipient's keyspace and flushed before
//! `send_message` returns. Read state is a separate `(recipient, message)`
//! marker set, so messages never change once written. A freshly opened
//! mailbox answers every query straight from the store, which is what makes
//! delivery survive a restart.
//!
//! Keyspaces:
//! - `messages`: `recipient/messageId` → [`Message`]
//! - `message_index`: `messageId` → recipient
//! - `read_markers`: `recipient/messageId` → read time
//! - `shared_tasks`: `taskId` → [`SharedTask`]
//! - `shared_task_status`: `taskId/agentId` → [`ParticipantStatus`]
//! - `agents`: the [`AgentRegistry`] roster

mod lock;
pub mod message;
pub mod shared_task;

pub use message::{Message, MessageDraft, MessageType, SYSTEM_SENDER};
pub use shared_task::{ParticipantStatus, SharedTask, SharedTaskView};

use crate::registry::{is_valid_agent_id, Agent, AgentRegistry, AgentStatus};
use crate::store::KvStore;
use crate::utils::{current_timestamp_millis, generate_id};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MESSAGES_TREE: &str = "messages";
const MESSAGE_INDEX_TREE: &str = "message_index";
const READ_MARKERS_TREE: &str = "read_markers";
const SHARED_TASKS_TREE: &str = "shared_tasks";
const SHARED_TASK_STATUS_TREE: &str = "shared_task_status";

const DB_FILE: &str = "mailbox.db";
const FILES_DIR: &str = "files";

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Shared task not found: {0}")]
    SharedTaskNotFound(String),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Invalid agent id '{0}': ids must be one path segment without '/', '\\' or '..'")]
    InvalidAgentId(String),

    #[error("Storage {} is in use by another agent-mesh process ({owner})", path.display())]
    StorageLocked { path: PathBuf, owner: String },

    #[error("Mailbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type MailboxResult<T> = Result<T, MailboxError>;

/// Result of [`Mailbox::share_file`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    pub message_id: String,
    pub path: PathBuf,
}

fn scoped_key(owner: &str, id: &str) -> String {
    format!("{}/{}", owner, id)
}

fn scope_prefix(owner: &str) -> String {
    format!("{}/", owner)
}

fn check_agent_id(id: &str) -> MailboxResult<()> {
    if is_valid_agent_id(id) {
        Ok(())
    } else {
        Err(MailboxError::InvalidAgentId(id.to_string()))
    }
}

pub struct Mailbox {
    store: KvStore,
    registry: AgentRegistry,
    root: PathBuf,
    files_root: PathBuf,
    // Declared last so the store is closed before the lock is released
    _lock: lock::StorageLock,
}

impl Mailbox {
    /// Open (or create) the mailbox under `root`. Only one process may hold
    /// a root open; others get [`MailboxError::StorageLocked`].
    pub fn open(root: &Path) -> MailboxResult<Self> {
        std::fs::create_dir_all(root)?;
        let lock = lock::StorageLock::acquire(root)?;
        let store = KvStore::open(&root.join(DB_FILE))?;
        let registry = AgentRegistry::new(store.clone());
        let files_root = root.join(FILES_DIR);
        std::fs::create_dir_all(&files_root)?;

        tracing::info!(
            "Opened mailbox at {} ({} agents, {} messages)",
            root.display(),
            registry.list()?.len(),
            store.count(MESSAGES_TREE)?
        );

        Ok(Self {
            store,
            registry,
            root: root.to_path_buf(),
            files_root,
            _lock: lock,
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// The storage root this mailbox was opened on
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn require_agent(&self, id: &str) -> MailboxResult<Agent> {
        self.registry
            .get(id)?
            .ok_or_else(|| MailboxError::AgentNotFound(id.to_string()))
    }

    fn agent_files_dir(&self, agent_id: &str) -> PathBuf {
        self.files_root.join(agent_id)
    }

    // ========================================================================
    // Agents
    // ========================================================================

    /// Persist the agent, create its file area and tell everyone else
    pub fn register_agent(&self, agent: &Agent) -> MailboxResult<()> {
        check_agent_id(&agent.id)?;
        self.registry.register(agent)?;
        std::fs::create_dir_all(self.agent_files_dir(&agent.id))?;

        let notified = self.broadcast(
            &agent.id,
            &format!("Agent joined: {}", agent.name),
            json!({
                "event": "agent-joined",
                "agentId": agent.id,
                "name": agent.name,
                "type": agent.agent_type,
                "capabilities": agent.capabilities,
            }),
        )?;

        tracing::info!("Agent {} registered, notified {} agents", agent.id, notified);
        Ok(())
    }

    /// Remove an agent from the roster. Its messages are retained.
    pub fn unregister_agent(&self, agent_id: &str) -> MailboxResult<Agent> {
        let agent = self
            .registry
            .unregister(agent_id)?
            .ok_or_else(|| MailboxError::AgentNotFound(agent_id.to_string()))?;
        tracing::info!("Agent {} unregistered", agent_id);
        Ok(agent)
    }

    pub fn update_agent_status(&self, agent_id: &str, status: AgentStatus) -> MailboxResult<Agent> {
        let agent = self
            .registry
            .update_status(agent_id, status)?
            .ok_or_else(|| MailboxError::AgentNotFound(agent_id.to_string()))?;

        self.broadcast(
            agent_id,
            &format!("Agent status changed: {} is {}", agent.name, status),
            json!({
                "event": "agent-status-changed",
                "agentId": agent_id,
                "status": status,
            }),
        )?;

        tracing::debug!("Agent {} is now {}", agent_id, status);
        Ok(agent)
    }

    /// Send a system notification to every agent except `about`
    fn broadcast(&self, about: &str, subject: &str, content: Value) -> MailboxResult<usize> {
        let mut sent = 0;
        for other in self.registry.list()? {
            if other.id == about {
                continue;
            }
            self.send_message(
                MessageDraft::new(SYSTEM_SENDER, &other.id, MessageType::Notification, subject)
                    .with_content(content.clone()),
            )?;
            sent += 1;
        }
        Ok(sent)
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Stamp and durably store a message. Returns its id once it is on disk.
    pub fn send_message(&self, draft: MessageDraft) -> MailboxResult<String> {
        check_agent_id(&draft.from)?;
        check_agent_id(&draft.to)?;
        let message = draft.into_message();

        self.store.set(
            MESSAGES_TREE,
            &scoped_key(&message.to, &message.id),
            &message,
        )?;
        self.store
            .set(MESSAGE_INDEX_TREE, &message.id, &message.to)?;
        self.store.flush()?;

        tracing::debug!(
            "Delivered {} {} from {} to {}",
            message.message_type,
            message.id,
            message.from,
            message.to
        );
        Ok(message.id)
    }

    pub fn get_message(&self, message_id: &str) -> MailboxResult<Option<Message>> {
        let Some(recipient) = self
            .store
            .get::<String>(MESSAGE_INDEX_TREE, message_id)?
        else {
            return Ok(None);
        };
        Ok(self
            .store
            .get(MESSAGES_TREE, &scoped_key(&recipient, message_id))?)
    }

    /// Every message addressed to the agent, oldest first
    pub fn get_messages_for_agent(&self, agent_id: &str) -> MailboxResult<Vec<Message>> {
        check_agent_id(agent_id)?;
        let mut messages: Vec<Message> = self
            .store
            .scan_prefix::<Message>(MESSAGES_TREE, &scope_prefix(agent_id))?
            .into_iter()
            .map(|(_, message)| message)
            .collect();

        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    pub fn get_unread_messages_for_agent(&self, agent_id: &str) -> MailboxResult<Vec<Message>> {
        check_agent_id(agent_id)?;
        let prefix = scope_prefix(agent_id);
        let read: HashSet<String> = self
            .store
            .scan_prefix::<DateTime<Utc>>(READ_MARKERS_TREE, &prefix)?
            .into_iter()
            .filter_map(|(key, _)| key.strip_prefix(&prefix).map(str::to_string))
            .collect();

        Ok(self
            .get_messages_for_agent(agent_id)?
            .into_iter()
            .filter(|m| !read.contains(&m.id))
            .collect())
    }

    /// Record that `agent_id` has read the message. Idempotent: returns true
    /// only the first time. Fails if the message is not in that agent's mailbox.
    pub fn mark_message_as_read(&self, message_id: &str, agent_id: &str) -> MailboxResult<bool> {
        check_agent_id(agent_id)?;
        let key = scoped_key(agent_id, message_id);
        if !self.store.contains(MESSAGES_TREE, &key)? {
            return Err(MailboxError::MessageNotFound(message_id.to_string()));
        }

        let newly_read = self
            .store
            .set_if_absent(READ_MARKERS_TREE, &key, &Utc::now())?;
        if newly_read {
            self.store.flush()?;
        }
        Ok(newly_read)
    }

    /// Answer a message: the original sender becomes the recipient
    pub fn reply_to_message(
        &self,
        original_id: &str,
        from: &str,
        content: Value,
        message_type: Option<MessageType>,
    ) -> MailboxResult<String> {
        let original = self
            .get_message(original_id)?
            .ok_or_else(|| MailboxError::MessageNotFound(original_id.to_string()))?;

        self.send_message(
            MessageDraft::new(
                from,
                &original.from,
                message_type.unwrap_or(MessageType::Response),
                format!("Re: {}", original.subject),
            )
            .with_content(content)
            .in_reply_to(&original.id),
        )
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Copy a file into the recipient's area and notify them of the copy
    pub async fn share_file(
        &self,
        from: &str,
        to: &str,
        path: &Path,
        description: &str,
    ) -> MailboxResult<SharedFile> {
        check_agent_id(from)?;
        check_agent_id(to)?;
        if from != SYSTEM_SENDER {
            self.require_agent(from)?;
        }
        self.require_agent(to)?;

        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            _ => return Err(MailboxError::FileNotFound(path.to_path_buf())),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MailboxError::FileNotFound(path.to_path_buf()))?;

        let target_dir = self.agent_files_dir(to);
        tokio::fs::create_dir_all(&target_dir).await?;
        let target = target_dir.join(format!("{}_{}", current_timestamp_millis(), file_name));
        tokio::fs::copy(path, &target).await?;

        let message_id = self.send_message(
            MessageDraft::new(
                from,
                to,
                MessageType::Notification,
                format!("File shared: {}", file_name),
            )
            .with_content(json!({
                "event": "file-shared",
                "fileName": file_name,
                "path": target,
                "originalPath": path,
                "size": metadata.len(),
                "description": description,
            })),
        )?;

        tracing::info!("{} shared {} with {}", from, file_name, to);
        Ok(SharedFile {
            message_id,
            path: target,
        })
    }

    // ========================================================================
    // Shared tasks
    // ========================================================================

    /// Persist a shared task, then send one request per assignee
    pub fn create_shared_task(
        &self,
        creator: &str,
        assignees: &[String],
        name: &str,
        description: &str,
        data: Value,
    ) -> MailboxResult<String> {
        check_agent_id(creator)?;
        for assignee in assignees {
            check_agent_id(assignee)?;
        }
        let task = SharedTask {
            id: generate_id("task"),
            name: name.to_string(),
            description: description.to_string(),
            creator: creator.to_string(),
            assignees: assignees.to_vec(),
            data,
            created_at: Utc::now(),
        };

        self.store.set(SHARED_TASKS_TREE, &task.id, &task)?;
        self.store.flush()?;

        for assignee in &task.assignees {
            self.send_message(
                MessageDraft::new(
                    creator,
                    assignee,
                    MessageType::Request,
                    format!("Task: {}", task.name),
                )
                .with_content(json!({
                    "taskId": task.id,
                    "name": task.name,
                    "description": task.description,
                    "data": task.data,
                    "assignees": task.assignees,
                })),
            )?;
        }

        tracing::info!(
            "Shared task {} created by {} for {} assignees",
            task.id,
            creator,
            task.assignees.len()
        );
        Ok(task.id)
    }

    /// Merge the agent's status into the task and notify every other
    /// participant. Returns the number of update messages sent.
    pub fn update_task_status(
        &self,
        agent_id: &str,
        task_id: &str,
        status: &str,
        message: &str,
    ) -> MailboxResult<usize> {
        check_agent_id(agent_id)?;
        let task: SharedTask = self
            .store
            .get(SHARED_TASKS_TREE, task_id)?
            .ok_or_else(|| MailboxError::SharedTaskNotFound(task_id.to_string()))?;

        let entry = ParticipantStatus {
            status: status.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        self.store.set(
            SHARED_TASK_STATUS_TREE,
            &scoped_key(task_id, agent_id),
            &entry,
        )?;
        self.store.flush()?;

        let mut notified = 0;
        for participant in task.participants() {
            if participant == agent_id {
                continue;
            }
            self.send_message(
                MessageDraft::new(
                    agent_id,
                    &participant,
                    MessageType::Update,
                    format!("Task update: {}", task.name),
                )
                .with_content(json!({
                    "taskId": task_id,
                    "status": status,
                    "message": message,
                    "agentId": agent_id,
                })),
            )?;
            notified += 1;
        }

        tracing::debug!(
            "Task {} status from {}: {} ({} notified)",
            task_id,
            agent_id,
            status,
            notified
        );
        Ok(notified)
    }

    pub fn get_shared_task(&self, task_id: &str) -> MailboxResult<Option<SharedTaskView>> {
        let Some(task) = self.store.get::<SharedTask>(SHARED_TASKS_TREE, task_id)? else {
            return Ok(None);
        };

        let prefix = scope_prefix(task_id);
        let statuses = self
            .store
            .scan_prefix::<ParticipantStatus>(SHARED_TASK_STATUS_TREE, &prefix)?
            .into_iter()
            .filter_map(|(key, status)| {
                key.strip_prefix(&prefix)
                    .map(|agent| (agent.to_string(), status))
            })
            .collect();

        Ok(Some(SharedTaskView { task, statuses }))
    }

    /// Shared tasks the agent created or is assigned to
    pub fn shared_tasks_for_agent(&self, agent_id: &str) -> MailboxResult<Vec<SharedTask>> {
        let mut tasks: Vec<SharedTask> = self
            .store
            .get_all::<SharedTask>(SHARED_TASKS_TREE)?
            .into_iter()
            .filter(|t| t.involves(agent_id))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn agent(id: &str) -> Agent {
        Agent::new(id, id.to_uppercase(), "worker").with_status(AgentStatus::Idle)
    }

    fn note(from: &str, to: &str, subject: &str) -> MessageDraft {
        MessageDraft::new(from, to, MessageType::Notification, subject)
    }

    #[test]
    fn test_register_broadcasts_to_existing_agents() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path()).unwrap();

        mailbox.register_agent(&agent("a")).unwrap();
        mailbox.register_agent(&agent("b")).unwrap();

        let inbox_a = mailbox.get_messages_for_agent("a").unwrap();
        assert_eq!(inbox_a.len(), 1);
        assert_eq!(inbox_a[0].from, SYSTEM_SENDER);
        assert_eq!(inbox_a[0].content["agentId"], "b");
        assert!(mailbox.get_messages_for_agent("b").unwrap().is_empty());
        assert!(dir.path().join("files").join("b").is_dir());
    }

    #[test]
    fn test_status_change_goes_through_registry() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path()).unwrap();
        mailbox.register_agent(&agent("a")).unwrap();
        mailbox.register_agent(&agent("b")).unwrap();

        mailbox.update_agent_status("b", AgentStatus::Busy).unwrap();

        assert_eq!(
            mailbox.registry().get("b").unwrap().unwrap().status,
            AgentStatus::Busy
        );
        let last = mailbox.get_messages_for_agent("a").unwrap().pop().unwrap();
        assert_eq!(last.content["event"], "agent-status-changed");
        assert_eq!(last.content["status"], "busy");

        assert!(matches!(
            mailbox.update_agent_status("nobody", AgentStatus::Idle),
            Err(MailboxError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_messages_survive_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let mailbox = Mailbox::open(dir.path()).unwrap();
            let id = mailbox.send_message(note("a", "b", "hello")).unwrap();
            mailbox.mark_message_as_read(&id, "b").unwrap();
            mailbox.send_message(note("a", "b", "second")).unwrap();
            id
        };

        let mailbox = Mailbox::open(dir.path()).unwrap();
        let inbox = mailbox.get_messages_for_agent("b").unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].id, id);
        assert_eq!(inbox[0].subject, "hello");

        let unread = mailbox.get_unread_messages_for_agent("b").unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].subject, "second");
        assert_eq!(mailbox.get_message(&id).unwrap().unwrap().to, "b");
    }

    #[test]
    fn test_mailboxes_are_isolated_by_prefix() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path()).unwrap();

        mailbox.send_message(note("x", "ab", "for ab")).unwrap();
        mailbox.send_message(note("x", "a", "for a")).unwrap();

        let inbox = mailbox.get_messages_for_agent("a").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].subject, "for a");
    }

    #[test]
    fn test_mark_as_read_is_idempotent() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path()).unwrap();
        let first = mailbox.send_message(note("a", "b", "one")).unwrap();
        mailbox.send_message(note("a", "b", "two")).unwrap();

        assert!(mailbox.mark_message_as_read(&first, "b").unwrap());
        let after_first = mailbox.get_unread_messages_for_agent("b").unwrap();
        assert!(!mailbox.mark_message_as_read(&first, "b").unwrap());
        assert_eq!(mailbox.get_unread_messages_for_agent("b").unwrap(), after_first);
        assert_eq!(after_first.len(), 1);

        // Only the recipient can mark it
        assert!(matches!(
            mailbox.mark_message_as_read(&first, "a"),
            Err(MailboxError::MessageNotFound(_))
        ));
    }

    #[test]
    fn test_reply_links_original() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path()).unwrap();
        let original = mailbox
            .send_message(MessageDraft::new("a", "b", MessageType::Request, "Summary please"))
            .unwrap();

        let reply_id = mailbox
            .reply_to_message(&original, "b", json!({ "summary": "done" }), None)
            .unwrap();

        let reply = mailbox.get_message(&reply_id).unwrap().unwrap();
        assert_eq!(reply.to, "a");
        assert_eq!(reply.subject, "Re: Summary please");
        assert_eq!(reply.message_type, MessageType::Response);
        assert_eq!(reply.reply_to.as_deref(), Some(original.as_str()));

        assert!(matches!(
            mailbox.reply_to_message("msg_missing", "b", Value::Null, None),
            Err(MailboxError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_share_file_copies_and_notifies() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(&dir.path().join("mesh")).unwrap();
        mailbox.register_agent(&agent("a")).unwrap();
        mailbox.register_agent(&agent("b")).unwrap();

        let source = dir.path().join("report.txt");
        std::fs::write(&source, "quarterly numbers").unwrap();

        let shared = mailbox
            .share_file("a", "b", &source, "Q3 report")
            .await
            .unwrap();

        assert!(shared.path.starts_with(dir.path().join("mesh").join("files").join("b")));
        assert_eq!(std::fs::read_to_string(&shared.path).unwrap(), "quarterly numbers");

        let notice = mailbox.get_message(&shared.message_id).unwrap().unwrap();
        assert_eq!(notice.to, "b");
        assert_eq!(notice.content["fileName"], "report.txt");
        assert_eq!(notice.content["description"], "Q3 report");
    }

    #[tokio::test]
    async fn test_share_file_validates_agents() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(&dir.path().join("mesh")).unwrap();
        mailbox.register_agent(&agent("b")).unwrap();
        let source = dir.path().join("notes.md");
        std::fs::write(&source, "# notes").unwrap();

        assert!(matches!(
            mailbox.share_file("stranger", "b", &source, "").await,
            Err(MailboxError::AgentNotFound(id)) if id == "stranger"
        ));
        assert!(matches!(
            mailbox.share_file("system", "nobody", &source, "").await,
            Err(MailboxError::AgentNotFound(id)) if id == "nobody"
        ));
        assert!(mailbox.share_file("system", "b", &source, "").await.is_ok());
        assert!(matches!(
            mailbox
                .share_file("system", "b", &dir.path().join("missing"), "")
                .await,
            Err(MailboxError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_shared_task_update_reaches_creator_once() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path()).unwrap();
        mailbox.register_agent(&agent("A")).unwrap();
        mailbox.register_agent(&agent("B")).unwrap();

        let tid = mailbox
            .create_shared_task("A", &["B".to_string()], "T1", "desc", json!({}))
            .unwrap();

        let requests: Vec<_> = mailbox
            .get_messages_for_agent("B")
            .unwrap()
            .into_iter()
            .filter(|m| m.message_type == MessageType::Request)
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].content["taskId"], tid.as_str());

        let notified = mailbox
            .update_task_status("B", &tid, "in_progress", "started")
            .unwrap();
        assert_eq!(notified, 1);

        let updates: Vec<_> = mailbox
            .get_messages_for_agent("A")
            .unwrap()
            .into_iter()
            .filter(|m| m.message_type == MessageType::Update)
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].content["taskId"], tid.as_str());
        assert_eq!(updates[0].content["status"], "in_progress");
        assert_eq!(updates[0].from, "B");

        // The updater does not hear about its own update
        assert!(mailbox
            .get_messages_for_agent("B")
            .unwrap()
            .iter()
            .all(|m| m.message_type != MessageType::Update));

        let view = mailbox.get_shared_task(&tid).unwrap().unwrap();
        assert_eq!(view.statuses["B"].status, "in_progress");
        assert_eq!(view.statuses["B"].message, "started");
    }

    #[test]
    fn test_shared_task_status_is_overwritten_per_agent() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path()).unwrap();
        let assignees = vec!["b".to_string(), "c".to_string()];
        let tid = mailbox
            .create_shared_task("a", &assignees, "Index", "", Value::Null)
            .unwrap();

        assert_eq!(mailbox.update_task_status("b", &tid, "started", "").unwrap(), 2);
        mailbox.update_task_status("c", &tid, "started", "").unwrap();
        mailbox.update_task_status("b", &tid, "done", "ok").unwrap();

        let view = mailbox.get_shared_task(&tid).unwrap().unwrap();
        assert_eq!(view.statuses.len(), 2);
        assert_eq!(view.statuses["b"].status, "done");
        assert_eq!(view.statuses["c"].status, "started");

        assert_eq!(mailbox.shared_tasks_for_agent("c").unwrap().len(), 1);
        assert!(mailbox.shared_tasks_for_agent("z").unwrap().is_empty());

        assert!(matches!(
            mailbox.update_task_status("b", "task_missing", "done", ""),
            Err(MailboxError::SharedTaskNotFound(_))
        ));
    }

    #[test]
    fn test_unregister_keeps_messages() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path()).unwrap();
        mailbox.register_agent(&agent("a")).unwrap();
        mailbox.send_message(note("system", "a", "welcome")).unwrap();

        mailbox.unregister_agent("a").unwrap();
        assert!(!mailbox.registry().contains("a").unwrap());
        assert_eq!(mailbox.get_messages_for_agent("a").unwrap().len(), 1);
        assert!(matches!(
            mailbox.unregister_agent("a"),
            Err(MailboxError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_ids_with_separators_are_rejected() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path()).unwrap();
        mailbox.register_agent(&agent("team")).unwrap();

        assert!(matches!(
            mailbox.send_message(note("x", "team/bob", "for bob")),
            Err(MailboxError::InvalidAgentId(id)) if id == "team/bob"
        ));
        assert!(matches!(
            mailbox.send_message(note("../x", "team", "spoofed")),
            Err(MailboxError::InvalidAgentId(_))
        ));
        assert!(matches!(
            mailbox.create_shared_task("team", &["team/bob".to_string()], "T", "", Value::Null),
            Err(MailboxError::InvalidAgentId(_))
        ));
        assert!(matches!(
            mailbox.get_messages_for_agent("team/"),
            Err(MailboxError::InvalidAgentId(_))
        ));

        // Nothing leaked into team's inbox
        assert!(mailbox.get_messages_for_agent("team").unwrap().is_empty());
    }

    #[test]
    fn test_agent_files_stay_under_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mesh");
        let mailbox = Mailbox::open(&root).unwrap();

        assert!(matches!(
            mailbox.register_agent(&Agent::new("../../escaped", "x", "worker")),
            Err(MailboxError::InvalidAgentId(_))
        ));
        assert!(!dir.path().join("escaped").exists());
        assert!(!root.join("files").join("..").join("..").join("escaped").exists());
        assert!(mailbox.registry().list().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_second_open_reports_owner() {
        let dir = tempdir().unwrap();
        let live = Mailbox::open(dir.path()).unwrap();
        live.send_message(note("a", "b", "hello")).unwrap();

        match Mailbox::open(dir.path()) {
            Err(MailboxError::StorageLocked { path, owner }) => {
                assert_eq!(path, dir.path());
                assert_eq!(owner, format!("pid {}", std::process::id()));
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("second open succeeded while the first is live"),
        }

        // The live mailbox is unaffected
        assert_eq!(live.get_messages_for_agent("b").unwrap().len(), 1);
    }
}
