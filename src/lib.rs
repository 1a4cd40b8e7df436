//! agent-mesh: orchestration core for a set of cooperating agents
//!
//! - [`events_bus`]: publish/subscribe hub shared by every component
//! - [`errors`]: severity-keyed error handler chains and retry with backoff
//! - [`registry`]: the agent roster and its single status entrypoint
//! - [`mailbox`]: durable messages, read markers, shared files and shared tasks
//! - [`scheduler`]: priority task queue drained by a bounded worker pool
//! - [`supervisor`]: builds, spawns, watches and stops agent processes
//! - [`runtime`]: wires the above together for one orchestration run
//! - [`control`]: lets other processes reach the runtime that owns the storage

pub mod config;
pub mod control;
pub mod errors;
pub mod events_bus;
pub mod mailbox;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod utils;

pub use runtime::MeshRuntime;

/// Install the global tracing subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    // A subscriber may already be installed (tests, embedding applications)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
