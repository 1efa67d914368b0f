//! ochopod - in-container coordination agent.
//!
//! A fleet of agents, one per container, discovers its peers through a
//! hierarchical coordination store, elects a leader per logical cluster and
//! drives every member through an ordered configuration lifecycle while
//! supervising an underlying application subprocess.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         pod agent                          │
//! ├───────────────────────────────────────────────────────────┤
//! │  Control surface: axum REST on the control port           │
//! ├───────────────────────────────────────────────────────────┤
//! │  Lifecycle: serialized FSM + subprocess supervisor        │
//! ├───────────────────────────────────────────────────────────┤
//! │  Leader stack: election | watcher (damper) | sweep driver │
//! ├───────────────────────────────────────────────────────────┤
//! │  Coordination: sessions, ephemeral nodes, one-shot watches│
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use ochopod::coord::MemoryStore;
//! use ochopod::lifecycle::{Piped, Reactive};
//! use ochopod::types::{ClusterView, CommandSpec};
//! use std::sync::Arc;
//!
//! struct Pod;
//!
//! impl Reactive for Pod {}
//! impl Piped for Pod {
//!     fn configure(&self, _cluster: &ClusterView) -> ochopod::Result<CommandSpec> {
//!         Ok(CommandSpec::new("redis-server"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> ochopod::Result<()> {
//!     let code = ochopod::boot(Arc::new(Pod), Arc::new(MemoryStore::new())).await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod agent;
pub mod binding;
pub mod config;
pub mod coord;
pub mod driver;
pub mod election;
pub mod error;
pub mod lifecycle;
pub mod logbuf;
pub mod registry;
pub mod retry;
pub mod server;
pub mod shutdown;
pub mod types;
pub mod watcher;

pub use error::{AgentError, Result};

use agent::Agent;
use coord::Store;
use lifecycle::Piped;
use shutdown::Shutdown;
use std::sync::Arc;

/// Probe the environment, wire the agent up and run it to completion.
/// Returns the process exit code.
pub async fn boot(hook: Arc<dyn Piped>, store: Arc<dyn Store>) -> Result<i32> {
    let (config, descriptor) = binding::probe_from_env()?;
    let logs = logbuf::init(config.debug);

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown::watch_signals(shutdown.clone()));

    Agent::new(config, descriptor, hook, store, logs, shutdown)
        .run()
        .await
}
