//! Coordination service facade.
//!
//! The agent talks to a ZooKeeper-like hierarchical store through the
//! [`Store`]/[`Session`] traits: sessions, ephemeral and sequential nodes,
//! one-shot watches and session events. Only the coordination actor holds the
//! session; every other component receives a cloneable handle and reaches the
//! store through it.
//!
//! Required semantics: a SUSPENDED session keeps its ephemeral nodes until it
//! is LOST; LOST drops them atomically and forces a cold restart of
//! registration, election and watching.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::ClusterKey;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Root path under which all cluster data lives.
pub const ROOT: &str = "/ochopod/clusters";

/// Session state transitions surfaced to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session (re)established.
    Connected,
    /// Transient connectivity loss; ephemeral nodes are retained.
    Suspended,
    /// Session expired; ephemeral nodes are gone.
    Lost,
}

/// A watch firing. Watches are one-shot: re-register after each event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Children of `path` changed (node created or deleted underneath).
    Children { path: String },
    /// The node at `path` was created, deleted, or its data changed.
    Node { path: String },
}

/// Channel end receiving watch firings.
pub type WatchSender = mpsc::UnboundedSender<WatchEvent>;

/// A live session against the coordination service.
#[async_trait]
pub trait Session: Send + Sync {
    /// Opaque session identifier, mostly for logging.
    fn id(&self) -> u64;

    /// Create an ephemeral sequential node. `prefix` ends with the node name
    /// stem (e.g. `.../pods/pod-`); the assigned sequence is appended and the
    /// full path returned.
    async fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> Result<String>;

    /// Create a persistent node. With `if_absent` an existing node is left
    /// untouched; otherwise it is an error.
    async fn create_persistent(&self, path: &str, data: &[u8], if_absent: bool) -> Result<()>;

    /// Overwrite a node's payload.
    async fn set(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read a node's payload and version.
    async fn get(&self, path: &str) -> Result<(Vec<u8>, u64)>;

    /// Delete a node.
    async fn delete(&self, path: &str) -> Result<()>;

    /// List direct children (relative names, sorted). A missing path yields
    /// an empty list; the watch still arms and fires on the first child.
    async fn children(&self, path: &str, watch: Option<WatchSender>) -> Result<Vec<String>>;

    /// Whether a node exists; the watch fires on creation, deletion or a
    /// data change.
    async fn exists(&self, path: &str, watch: Option<WatchSender>) -> Result<bool>;

    /// Subscribe to session state events.
    fn events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Close the session, dropping its ephemeral nodes.
    async fn close(&self);
}

/// Handle to a coordination service able to open sessions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a session. Fails when the service is unreachable.
    async fn connect(&self, session_timeout: Duration) -> Result<Arc<dyn Session>>;
}

/// Well-known paths for one cluster.
#[derive(Debug, Clone)]
pub struct ClusterPaths {
    prefix: String,
}

impl ClusterPaths {
    pub fn new(key: &ClusterKey) -> Self {
        Self {
            prefix: format!("{}/{}", ROOT, key),
        }
    }

    /// Parent of the per-pod registration nodes.
    pub fn pods(&self) -> String {
        format!("{}/pods", self.prefix)
    }

    /// Stem for ephemeral sequential registration nodes.
    pub fn pod_stem(&self) -> String {
        format!("{}/pods/pod-", self.prefix)
    }

    /// Parent of the election candidate nodes.
    pub fn lock(&self) -> String {
        format!("{}/lock", self.prefix)
    }

    /// Stem for ephemeral sequential election nodes.
    pub fn lock_stem(&self) -> String {
        format!("{}/lock/n-", self.prefix)
    }

    /// Last committed reconfiguration hash.
    pub fn hash(&self) -> String {
        format!("{}/hash", self.prefix)
    }

    /// Member snapshot as of the last committed sweep.
    pub fn snapshot(&self) -> String {
        format!("{}/snapshot", self.prefix)
    }

    /// Cluster state summary.
    pub fn state(&self) -> String {
        format!("{}/state", self.prefix)
    }
}

/// Parse the sequence suffix from a sequential node path, e.g.
/// `.../pods/pod-0000000012` yields 12.
pub fn sequence_of(path: &str) -> Option<u64> {
    path.rsplit('-').next()?.parse().ok()
}
