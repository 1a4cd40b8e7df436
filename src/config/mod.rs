//! Config module - TOML configuration for the orchestration core

pub mod toml_config;

pub use toml_config::{
    config_path, load_config, save_config, try_load_config, CommandConfig, ConfigError,
    LoggingConfig, MeshConfig, RetryConfig, SchedulerConfig, StorageConfig, SupervisorConfig,
};
