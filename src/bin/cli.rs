//! agent-mesh CLI
//!
//! Command-line interface for the orchestration core: manage the agent roster,
//! exchange mailbox messages, coordinate shared tasks and supervise agent processes.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use agent_mesh::config::{self, MeshConfig};
use agent_mesh::control::{self, ControlRequest};
use agent_mesh::mailbox::{MailboxError, Message, MessageType, SharedTaskView, SYSTEM_SENDER};
use agent_mesh::registry::{Agent, AgentStatus};
use agent_mesh::scheduler::TaskPriority;
use agent_mesh::MeshRuntime;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "agent-mesh")]
#[command(about = "Agent orchestration core command line interface")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the per-user config location)
    #[arg(short, long, env = "AGENT_MESH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered agents
    Agents {
        /// Only agents with this status
        #[arg(short, long)]
        status: Option<AgentStatus>,
    },

    /// Register (or replace) an agent
    Register {
        id: String,

        /// Display name (defaults to the id)
        #[arg(short, long)]
        name: Option<String>,

        /// Agent type
        #[arg(short = 't', long = "type", default_value = "generic")]
        agent_type: String,

        /// Capability, may be repeated
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Project directory used when starting the agent process
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Set an agent's status
    Status { id: String, status: AgentStatus },

    /// Send a message
    Send {
        to: String,
        subject: String,

        /// Message body; parsed as JSON when possible
        content: Option<String>,

        #[arg(long, default_value = SYSTEM_SENDER)]
        from: String,

        #[arg(short = 't', long = "type", default_value = "notification")]
        message_type: MessageType,
    },

    /// Show an agent's messages
    Inbox {
        agent: String,

        /// Only messages the agent has not read
        #[arg(short, long)]
        unread: bool,
    },

    /// Mark a message as read by an agent
    Read { agent: String, message_id: String },

    /// Reply to a message
    Reply {
        message_id: String,
        from: String,
        content: String,

        #[arg(short = 't', long = "type")]
        message_type: Option<MessageType>,
    },

    /// Copy a file into another agent's area
    Share {
        from: String,
        to: String,
        file: PathBuf,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Shared tasks
    #[command(subcommand)]
    Task(TaskCommands),

    /// Start agent processes and supervise them until interrupted.
    /// If another process already supervises this storage, it starts them.
    Start {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Stop a running agent process
    Stop { id: String },

    /// Stop an agent process if running, then start it again
    Restart { id: String },

    /// Run a task description on an in-process agent
    Run {
        description: String,

        #[arg(short, long, default_value = "cli")]
        agent: String,

        #[arg(short, long, default_value = "normal")]
        priority: TaskPriority,
    },

    /// Show the effective configuration
    Config {
        /// Print only the config file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a shared task
    Create {
        name: String,

        /// Assignee, may be repeated
        #[arg(short, long = "assignee", required = true)]
        assignees: Vec<String>,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Creating agent (defaults to the system)
        #[arg(long)]
        creator: Option<String>,

        /// Task data as JSON
        #[arg(long)]
        data: Option<String>,
    },

    /// Record a participant's status on a shared task
    Update {
        task_id: String,
        agent: String,
        status: String,

        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Show a shared task and its participant statuses
    Show { task_id: String },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config_file = cli.config.clone().unwrap_or_else(config::config_path);
    let config = match config::try_load_config(&config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: invalid config {}: {}", config_file.display(), e);
            process::exit(1);
        }
    };

    let filter = if cli.verbose {
        "agent_mesh=debug".to_string()
    } else {
        config.logging.filter.clone()
    };
    agent_mesh::init_tracing(&filter);

    match run_command(cli, config, config_file).await {
        Ok(_) => process::exit(0),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

async fn run_command(cli: Cli, config: MeshConfig, config_file: PathBuf) -> Result<()> {
    let format = cli.format;

    let request = match cli.command {
        Commands::Config { path } => {
            if path {
                println!("{}", config_file.display());
            } else {
                print_config(&config, format)?;
            }
            return Ok(());
        }

        Commands::Start { ids } => return start(config, ids, format).await,

        Commands::Restart { id } => return restart(config, id, format).await,

        Commands::Agents { status } => ControlRequest::ListAgents { status },

        Commands::Register {
            id,
            name,
            agent_type,
            capabilities,
            path,
        } => {
            let name = name.unwrap_or_else(|| id.clone());
            let mut agent = Agent::new(id, name, agent_type).with_capabilities(capabilities);
            if let Some(path) = path {
                agent = agent.with_path(resolve(&path, "agent path")?);
            }
            ControlRequest::RegisterAgent { agent }
        }

        Commands::Status { id, status } => ControlRequest::SetStatus { id, status },

        Commands::Send {
            to,
            subject,
            content,
            from,
            message_type,
        } => ControlRequest::SendMessage {
            from,
            to,
            message_type,
            subject,
            content: content.map(|c| parse_content(&c)).unwrap_or(Value::Null),
        },

        Commands::Inbox { agent, unread } => ControlRequest::Inbox { agent, unread },

        Commands::Read { agent, message_id } => ControlRequest::MarkRead { agent, message_id },

        Commands::Reply {
            message_id,
            from,
            content,
            message_type,
        } => ControlRequest::Reply {
            message_id,
            from,
            content: parse_content(&content),
            message_type,
        },

        Commands::Share {
            from,
            to,
            file,
            description,
        } => ControlRequest::ShareFile {
            from,
            to,
            path: resolve(&file, "file")?,
            description,
        },

        Commands::Task(TaskCommands::Create {
            name,
            assignees,
            description,
            creator,
            data,
        }) => ControlRequest::CreateTask {
            creator,
            assignees,
            name,
            description,
            data: data.map(|d| parse_content(&d)).unwrap_or(Value::Null),
        },

        Commands::Task(TaskCommands::Update {
            task_id,
            agent,
            status,
            message,
        }) => ControlRequest::UpdateTask {
            task_id,
            agent,
            status,
            message,
        },

        Commands::Task(TaskCommands::Show { task_id }) => ControlRequest::ShowTask { task_id },

        Commands::Stop { id } => ControlRequest::StopAgent { id },

        Commands::Run {
            description,
            agent,
            priority,
        } => ControlRequest::RunTask {
            agent,
            description,
            priority,
        },
    };

    let data = dispatch(&config, &request).await?;
    print_response(&request, &data, format)
}

/// Paths travel to whichever process owns the storage, so make them absolute
fn resolve(path: &Path, what: &str) -> Result<PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("{} {} not found", what, path.display()))
}

/// Run a request against the storage directly, or through the process that
/// currently holds it
async fn dispatch(config: &MeshConfig, request: &ControlRequest) -> Result<Value> {
    match MeshRuntime::open(config.clone()) {
        Ok(runtime) => {
            if matches!(request, ControlRequest::RunTask { .. }) {
                runtime.start();
            }
            let result = control::execute(&runtime, request.clone()).await;
            runtime.shutdown().await;
            result
        }
        Err(MailboxError::StorageLocked { owner, .. }) => {
            tracing::debug!("Storage held by {}, forwarding request", owner);
            control::send(&config.storage.root, request)
                .await
                .with_context(|| format!("storage is in use by {}", owner))
        }
        Err(e) => Err(e).context("failed to open mailbox storage"),
    }
}

/// Who supervises the storage for a `start` or `restart`
enum Supervisor {
    Local(Arc<MeshRuntime>),
    /// Another process holds the storage; this names it
    Remote(String),
}

fn open_supervising(config: &MeshConfig) -> Result<Supervisor> {
    match MeshRuntime::open(config.clone()) {
        Ok(runtime) => Ok(Supervisor::Local(Arc::new(runtime))),
        Err(MailboxError::StorageLocked { owner, .. }) => Ok(Supervisor::Remote(owner)),
        Err(e) => Err(e).context("failed to open mailbox storage"),
    }
}

async fn start(config: MeshConfig, ids: Vec<String>, format: OutputFormat) -> Result<()> {
    let runtime = match open_supervising(&config)? {
        Supervisor::Local(runtime) => runtime,
        Supervisor::Remote(owner) => {
            for id in ids {
                let request = ControlRequest::StartAgent { id };
                let data = control::send(&config.storage.root, &request)
                    .await
                    .with_context(|| format!("storage is in use by {}", owner))?;
                print_response(&request, &data, format)?;
            }
            return Ok(());
        }
    };

    runtime.start();
    for id in &ids {
        if let Err(e) = runtime.supervisor().start_agent(id).await {
            runtime.shutdown().await;
            return Err(e.into());
        }
        println!("Started {} (pid {})", id, pid_label(runtime.supervisor().pid(id).map(u64::from)));
    }
    supervise_until_interrupted(runtime).await
}

async fn restart(config: MeshConfig, id: String, format: OutputFormat) -> Result<()> {
    let runtime = match open_supervising(&config)? {
        Supervisor::Local(runtime) => runtime,
        Supervisor::Remote(owner) => {
            let request = ControlRequest::RestartAgent { id };
            let data = control::send(&config.storage.root, &request)
                .await
                .with_context(|| format!("storage is in use by {}", owner))?;
            return print_response(&request, &data, format);
        }
    };

    runtime.start();
    if let Err(e) = runtime.supervisor().restart_agent(&id).await {
        runtime.shutdown().await;
        return Err(e.into());
    }
    println!("Restarted {} (pid {})", id, pid_label(runtime.supervisor().pid(&id).map(u64::from)));
    supervise_until_interrupted(runtime).await
}

/// Serve other invocations and keep supervised processes alive until Ctrl-C,
/// then stop them all
async fn supervise_until_interrupted(runtime: Arc<MeshRuntime>) -> Result<()> {
    #[cfg(unix)]
    let server = match control::serve(Arc::clone(&runtime)) {
        Ok(server) => Some(server),
        Err(e) => {
            tracing::warn!("Control channel unavailable, other invocations cannot reach this one: {}", e);
            None
        }
    };

    println!("Supervising {} agent(s), press Ctrl-C to stop", runtime.supervisor().running_agents().len());
    let interrupted = tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C");

    #[cfg(unix)]
    if let Some(server) = server {
        server.stop().await;
    }
    runtime.shutdown().await;
    interrupted
}

fn print_response(request: &ControlRequest, data: &Value, format: OutputFormat) -> Result<()> {
    match request {
        ControlRequest::ListAgents { .. } => {
            let agents: Vec<Agent> = serde_json::from_value(data.clone())?;
            print_agents(&agents, format)
        }
        ControlRequest::RegisterAgent { agent } => {
            print_value(data, format, &format!("Registered {}", agent.id))
        }
        ControlRequest::SetStatus { id, .. } => print_value(
            data,
            format,
            &format!("{} is now {}", id, text_field(data, "status")),
        ),
        ControlRequest::SendMessage { .. } => print_id(text_field(data, "id"), format, "Sent message"),
        ControlRequest::Inbox { .. } => {
            let messages: Vec<Message> = serde_json::from_value(data.clone())?;
            print_messages(&messages, format)
        }
        ControlRequest::MarkRead { agent, message_id } => {
            let note = if data["newlyRead"].as_bool().unwrap_or(false) {
                format!("{} marked as read by {}", message_id, agent)
            } else {
                format!("{} was already read by {}", message_id, agent)
            };
            print_value(data, format, &note)
        }
        ControlRequest::Reply { .. } => print_id(text_field(data, "id"), format, "Sent reply"),
        ControlRequest::ShareFile { .. } => print_value(
            data,
            format,
            &format!("Shared as {}", text_field(data, "path")),
        ),
        ControlRequest::CreateTask { .. } => {
            print_id(text_field(data, "id"), format, "Created shared task")
        }
        ControlRequest::UpdateTask { task_id, .. } => print_value(
            data,
            format,
            &format!("Updated {} ({} participants notified)", task_id, data["notified"]),
        ),
        ControlRequest::ShowTask { .. } => {
            let view: SharedTaskView = serde_json::from_value(data.clone())?;
            print_task(&view, format)
        }
        ControlRequest::StartAgent { id } => print_value(
            data,
            format,
            &format!("Started {} (pid {})", id, pid_label(data["pid"].as_u64())),
        ),
        ControlRequest::RestartAgent { id } => print_value(
            data,
            format,
            &format!("Restarted {} (pid {})", id, pid_label(data["pid"].as_u64())),
        ),
        ControlRequest::StopAgent { id } => {
            let note = if data["stopped"].as_bool().unwrap_or(false) {
                format!("Stopped {}", id)
            } else {
                format!("{} is not running", id)
            };
            print_value(data, format, &note)
        }
        ControlRequest::RunTask { .. } => match data["status"].as_str() {
            Some("queued") => print_id(text_field(data, "id"), format, "Task queued"),
            _ => print_value(&data["result"], format, "Task completed"),
        },
    }
}

fn print_task(view: &SharedTaskView, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(view)?,
        OutputFormat::Text => {
            println!("{} ({})", view.task.name, view.task.id);
            println!("Creator:   {}", view.task.creator);
            println!("Assignees: {}", view.task.assignees.join(", "));
            if !view.task.description.is_empty() {
                println!("{}", view.task.description);
            }
            for (agent, status) in &view.statuses {
                println!("  {:<16} {:<12} {}", agent, status.status, status.message);
            }
        }
    }
    Ok(())
}

fn text_field<'a>(data: &'a Value, key: &str) -> &'a str {
    data[key].as_str().unwrap_or("-")
}

/// JSON when it parses, a plain string otherwise
fn parse_content(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn pid_label(pid: Option<u64>) -> String {
    pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}

fn print_value(value: &Value, format: OutputFormat, text: &str) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => println!("{}", text),
    }
    Ok(())
}

fn print_id(id: &str, format: OutputFormat, text: &str) -> Result<()> {
    print_value(&serde_json::json!({ "id": id }), format, &format!("{}: {}", text, id))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_agents(agents: &[Agent], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&agents)?,
        OutputFormat::Text => {
            if agents.is_empty() {
                println!("No agents registered");
                return Ok(());
            }
            println!("{:<20} {:<14} {:<8} Capabilities", "ID", "Type", "Status");
            println!("{}", "-".repeat(64));
            for agent in agents {
                let capabilities: Vec<&str> =
                    agent.capabilities.iter().map(String::as_str).collect();
                println!(
                    "{:<20} {:<14} {:<8} {}",
                    agent.id,
                    agent.agent_type,
                    agent.status,
                    capabilities.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn print_messages(messages: &[Message], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&messages)?,
        OutputFormat::Text => {
            if messages.is_empty() {
                println!("No messages");
                return Ok(());
            }
            for message in messages {
                println!(
                    "[{}] {} {} -> {}: {}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.message_type,
                    message.from,
                    message.to,
                    message.subject
                );
                println!("    id: {}", message.id);
                if !message.content.is_null() {
                    println!("    {}", message.content);
                }
            }
        }
    }
    Ok(())
}

fn print_config(config: &MeshConfig, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(config)?,
        OutputFormat::Text => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}
