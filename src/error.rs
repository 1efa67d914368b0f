//! Error types for the ochopod agent.
//!
//! This module provides a unified error type [`AgentError`] for all agent
//! operations, along with a convenient [`Result`] type alias.
//!
//! Errors fall into a few categories:
//!
//! - **Coordination**: session and node errors against the coordination service
//! - **Binding**: environment probe failures (always fatal, exit code 1)
//! - **Hook**: user lifecycle callbacks rejecting or crashing
//! - **Sweep**: cluster-wide reconfiguration failures seen by the leader
//! - **Subprocess**: child process management errors

use std::io;
use thiserror::Error;

/// Main error type for agent operations.
#[derive(Error, Debug)]
pub enum AgentError {
    // Coordination errors
    #[error("coordination service unreachable: {0}")]
    Unreachable(String),

    #[error("coordination session lost")]
    SessionLost,

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    // Binding errors
    #[error("binding probe failed: {0}")]
    Binding(String),

    // Hook errors
    #[error("pre-check rejected: {0}")]
    HookRejection(String),

    #[error("hook crashed: {0}")]
    HookCrash(String),

    // Sweep errors
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("sweep aborted: {0}")]
    SweepAborted(String),

    #[error("leadership lost")]
    LockLost,

    // Subprocess errors
    #[error("subprocess failure: {0}")]
    Subprocess(String),

    // Configuration and plumbing
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AgentError {
    /// Whether the operation may succeed if retried.
    ///
    /// Transient coordination losses and peer failures are retryable; binding
    /// errors, hook rejections and configuration errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Unreachable(_)
                | AgentError::SessionLost
                | AgentError::PeerUnreachable(_)
                | AgentError::SweepAborted(_)
                | AgentError::Network(_)
                | AgentError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AgentError::SessionLost.is_retryable());
        assert!(AgentError::PeerUnreachable("10.0.0.1:8080".into()).is_retryable());
        assert!(AgentError::Timeout("sweep".into()).is_retryable());

        assert!(!AgentError::Binding("no cluster".into()).is_retryable());
        assert!(!AgentError::HookRejection("not ready".into()).is_retryable());
        assert!(!AgentError::Config("bad port".into()).is_retryable());
    }

    #[test]
    fn test_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{broken").unwrap_err();
        let converted: AgentError = err.into();
        assert!(matches!(converted, AgentError::Serialization(_)));
    }
}
