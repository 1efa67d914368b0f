//! Agent configuration.
//!
//! Settings are normally derived from the environment by the binding probe
//! (see [`crate::binding`]); this module holds the resolved configuration and
//! its validation rules.

use crate::error::{AgentError, Result};
use crate::types::ClusterKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default control port when the orchestrator does not remap one.
pub const DEFAULT_CONTROL_PORT: u16 = 8080;

/// Default namespace qualifying bare cluster names.
pub const DEFAULT_NAMESPACE: &str = "marathon";

/// Resolved agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Fully qualified cluster key this pod belongs to.
    pub cluster: ClusterKey,
    /// Logical application label.
    pub application: String,
    /// Container-side control port.
    pub control_port: u16,
    /// Coordination service endpoints (`host:port`, comma separated in env).
    pub endpoints: Vec<String>,
    /// Verbose logging toggle.
    pub debug: bool,
    /// If false the pod registers but stays stopped until `/control/on`.
    pub autostart: bool,
    /// Coordination session timeout.
    pub session_timeout: Duration,
    /// Consecutive failed (re)connects tolerated before the agent exits
    /// with code 2.
    pub retry_budget: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterKey::new(DEFAULT_NAMESPACE, "default"),
            application: String::new(),
            control_port: DEFAULT_CONTROL_PORT,
            endpoints: vec!["127.0.0.1:2181".to_string()],
            debug: false,
            autostart: true,
            session_timeout: Duration::from_secs(10),
            retry_budget: 8,
        }
    }
}

impl AgentConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.name.is_empty() {
            return Err(AgentError::Config("cluster name must not be empty".into()));
        }
        if self.cluster.namespace.is_empty() {
            return Err(AgentError::Config("namespace must not be empty".into()));
        }
        if self.endpoints.is_empty() {
            return Err(AgentError::Config(
                "at least one coordination endpoint is required".into(),
            ));
        }
        if self.session_timeout < Duration::from_secs(1) {
            return Err(AgentError::Config(
                "session timeout must be at least one second".into(),
            ));
        }
        Ok(())
    }
}
