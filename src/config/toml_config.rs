//! TOML Configuration with Environment Variable Overrides
//!
//! Supports:
//! - TOML configuration file
//! - Environment variable overrides (`AGENT_MESH_*`)
//! - Atomic writes with backup

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "agent-mesh";
const CONFIG_FILE: &str = "config.toml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MeshConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding the mailbox database and shared files
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_concurrent_tasks() -> usize {
    5
}
fn default_poll_interval_ms() -> u64 {
    100
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}

/// A program plus its arguments, run inside the agent's directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandConfig {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for CommandConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// File that marks a directory as an agent project
    #[serde(default = "default_descriptor_file")]
    pub descriptor_file: String,
    /// Directory whose absence triggers the install step
    #[serde(default = "default_dependency_dir")]
    pub dependency_dir: String,
    /// Directory whose absence triggers the build step
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    /// How long a stopped agent gets to exit before it is killed
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_install_command")]
    pub install: CommandConfig,
    #[serde(default = "default_build_command")]
    pub build: CommandConfig,
    #[serde(default = "default_run_command")]
    pub run: CommandConfig,
}

fn default_descriptor_file() -> String {
    "package.json".to_string()
}
fn default_dependency_dir() -> String {
    "node_modules".to_string()
}
fn default_build_dir() -> String {
    "dist".to_string()
}
fn default_install_command() -> CommandConfig {
    CommandConfig::new("npm", &["install"])
}
fn default_build_command() -> CommandConfig {
    CommandConfig::new("npm", &["run", "build"])
}
fn default_run_command() -> CommandConfig {
    CommandConfig::new("npm", &["start"])
}
fn default_stop_grace_ms() -> u64 {
    5000
}

impl SupervisorConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            descriptor_file: default_descriptor_file(),
            dependency_dir: default_dependency_dir(),
            build_dir: default_build_dir(),
            stop_grace_ms: default_stop_grace_ms(),
            install: default_install_command(),
            build: default_build_command(),
            run: default_run_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "agent_mesh=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Default config file location: `<config_dir>/agent-mesh/config.toml`
pub fn config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

/// Strictly load a config file. A missing file yields the defaults; a
/// malformed one is an error. Environment overrides are applied either way.
pub fn try_load_config(path: &Path) -> Result<MeshConfig, ConfigError> {
    let config = if path.exists() {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str::<MeshConfig>(&contents)?;
        tracing::info!("Loaded TOML config from {:?}", path);
        config
    } else {
        MeshConfig::default()
    };

    Ok(apply_env_overrides(config))
}

/// Load config, falling back to defaults (with env overrides) on any error
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);

    match try_load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring config at {:?}: {}", path, e);
            apply_env_overrides(MeshConfig::default())
        }
    }
}

pub fn save_config(config: &MeshConfig, path: &Path) -> Result<(), ConfigError> {
    // Create parent directory if needed
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Create backup if file exists
    if path.exists() {
        let backup_path = path.with_extension("toml.bak");
        let _ = fs::copy(path, &backup_path);
    }

    let contents = toml::to_string_pretty(config)?;

    // Write to temp file first, then rename into place
    let temp_path = path.with_extension("toml.tmp");
    fs::write(&temp_path, &contents)?;
    fs::rename(&temp_path, path)?;

    tracing::info!("Saved TOML config to {:?}", path);
    Ok(())
}

fn apply_env_overrides(config: MeshConfig) -> MeshConfig {
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides(
    mut config: MeshConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> MeshConfig {
    if let Some(root) = lookup("AGENT_MESH_STORAGE_ROOT") {
        if !root.is_empty() {
            config.storage.root = PathBuf::from(root);
        }
    }

    if let Some(max) = lookup("AGENT_MESH_MAX_CONCURRENT_TASKS") {
        if let Ok(n) = max.parse::<usize>() {
            config.scheduler.max_concurrent_tasks = n;
        }
    }

    if let Some(interval) = lookup("AGENT_MESH_POLL_INTERVAL_MS") {
        if let Ok(ms) = interval.parse::<u64>() {
            config.scheduler.poll_interval_ms = ms;
        }
    }

    if let Some(filter) = lookup("AGENT_MESH_LOG") {
        if !filter.is_empty() {
            config.logging.filter = filter;
        }
    }

    config
}
