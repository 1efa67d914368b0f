//! In-process coordination store.
//!
//! A complete implementation of the [`Store`]/[`Session`] contract backed by
//! a shared in-memory tree: per-session ephemeral ownership, monotonically
//! increasing sequence counters, one-shot watches and injectable session
//! faults. It powers the integration suite and single-host deployments; a
//! real ensemble adapter plugs in behind the same traits.

use super::{Session, SessionEvent, Store, WatchEvent, WatchSender};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: u64,
    /// Owning session for ephemeral nodes.
    owner: Option<u64>,
}

struct SessionState {
    alive: bool,
    suspended: bool,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Default)]
struct Shared {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    sessions: HashMap<u64, SessionState>,
    next_session: u64,
    child_watches: HashMap<String, Vec<WatchSender>>,
    node_watches: HashMap<String, Vec<WatchSender>>,
    unreachable: bool,
}

impl Shared {
    fn parent_of(path: &str) -> Option<&str> {
        path.rfind('/').filter(|&i| i > 0).map(|i| &path[..i])
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut fired = Vec::new();
        let mut prefix = String::new();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            prefix.push('/');
            prefix.push_str(segment);
            if !self.nodes.contains_key(&prefix) {
                self.nodes.insert(
                    prefix.clone(),
                    Node {
                        data: Vec::new(),
                        version: 0,
                        owner: None,
                    },
                );
                fired.push(prefix.clone());
            }
        }
        for created in fired {
            self.fire_node(&created);
            if let Some(parent) = Self::parent_of(&created).map(str::to_string) {
                self.fire_children(&parent);
            }
        }
    }

    fn fire_children(&mut self, parent: &str) {
        if let Some(watchers) = self.child_watches.remove(parent) {
            for watcher in watchers {
                let _ = watcher.send(WatchEvent::Children {
                    path: parent.to_string(),
                });
            }
        }
    }

    fn fire_node(&mut self, path: &str) {
        if let Some(watchers) = self.node_watches.remove(path) {
            for watcher in watchers {
                let _ = watcher.send(WatchEvent::Node {
                    path: path.to_string(),
                });
            }
        }
    }

    fn insert(&mut self, path: String, data: Vec<u8>, owner: Option<u64>) {
        self.ensure_parents(&path);
        self.nodes.insert(
            path.clone(),
            Node {
                data,
                version: 0,
                owner,
            },
        );
        self.fire_node(&path);
        if let Some(parent) = Self::parent_of(&path).map(str::to_string) {
            self.fire_children(&parent);
        }
    }

    fn remove(&mut self, path: &str) -> Option<Node> {
        let node = self.nodes.remove(path)?;
        self.fire_node(path);
        if let Some(parent) = Self::parent_of(path).map(str::to_string) {
            self.fire_children(&parent);
        }
        Some(node)
    }

    /// Check that a session may issue requests.
    fn gate(&self, session: u64) -> Result<()> {
        match self.sessions.get(&session) {
            Some(state) if !state.alive => Err(AgentError::SessionLost),
            Some(state) if state.suspended => {
                Err(AgentError::Unreachable("session suspended".into()))
            }
            Some(_) => Ok(()),
            None => Err(AgentError::SessionLost),
        }
    }

    fn expire(&mut self, session: u64) {
        let Some(state) = self.sessions.get_mut(&session) else {
            return;
        };
        if !state.alive {
            return;
        }
        state.alive = false;
        let events = state.events.clone();

        let orphaned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in orphaned {
            self.remove(&path);
        }
        let _ = events.send(SessionEvent::Lost);
    }
}

/// Shared in-memory coordination service.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: make subsequent `connect` calls fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.lock().unreachable = unreachable;
    }

    /// Fault injection: suspend a session. Requests fail transiently but
    /// ephemeral nodes are retained.
    pub fn suspend(&self, session: u64) {
        let mut shared = self.shared.lock();
        if let Some(state) = shared.sessions.get_mut(&session) {
            if state.alive && !state.suspended {
                state.suspended = true;
                let _ = state.events.send(SessionEvent::Suspended);
            }
        }
    }

    /// Fault injection: lift a suspension.
    pub fn heal(&self, session: u64) {
        let mut shared = self.shared.lock();
        if let Some(state) = shared.sessions.get_mut(&session) {
            if state.alive && state.suspended {
                state.suspended = false;
                let _ = state.events.send(SessionEvent::Connected);
            }
        }
    }

    /// Fault injection: expire a session, dropping its ephemeral nodes.
    pub fn expire(&self, session: u64) {
        self.shared.lock().expire(session);
    }

    /// Read a node without a session (test inspection).
    pub fn peek(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// Owning session of an ephemeral node (test inspection).
    pub fn session_of(&self, path: &str) -> Option<u64> {
        self.shared.lock().nodes.get(path).and_then(|n| n.owner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn connect(&self, _session_timeout: Duration) -> Result<Arc<dyn Session>> {
        let mut shared = self.shared.lock();
        if shared.unreachable {
            return Err(AgentError::Unreachable("in-memory store offline".into()));
        }
        shared.next_session += 1;
        let id = shared.next_session;
        let (events, _) = broadcast::channel(16);
        shared.sessions.insert(
            id,
            SessionState {
                alive: true,
                suspended: false,
                events: events.clone(),
            },
        );
        Ok(Arc::new(MemorySession {
            id,
            shared: Arc::clone(&self.shared),
            events,
        }))
    }
}

struct MemorySession {
    id: u64,
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<SessionEvent>,
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> Result<String> {
        let mut shared = self.shared.lock();
        shared.gate(self.id)?;
        let counter = shared.sequences.entry(prefix.to_string()).or_insert(0);
        let seq = *counter;
        *counter += 1;
        let path = format!("{}{:010}", prefix, seq);
        shared.insert(path.clone(), data.to_vec(), Some(self.id));
        Ok(path)
    }

    async fn create_persistent(&self, path: &str, data: &[u8], if_absent: bool) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.gate(self.id)?;
        if shared.nodes.contains_key(path) {
            if if_absent {
                return Ok(());
            }
            return Err(AgentError::NodeExists(path.to_string()));
        }
        shared.insert(path.to_string(), data.to_vec(), None);
        Ok(())
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.gate(self.id)?;
        match shared.nodes.get_mut(path) {
            Some(node) => {
                node.data = data.to_vec();
                node.version += 1;
                shared.fire_node(path);
                Ok(())
            }
            None => Err(AgentError::NodeNotFound(path.to_string())),
        }
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, u64)> {
        let shared = self.shared.lock();
        shared.gate(self.id)?;
        shared
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.version))
            .ok_or_else(|| AgentError::NodeNotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.gate(self.id)?;
        shared
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| AgentError::NodeNotFound(path.to_string()))
    }

    async fn children(&self, path: &str, watch: Option<WatchSender>) -> Result<Vec<String>> {
        let mut shared = self.shared.lock();
        shared.gate(self.id)?;
        if let Some(watch) = watch {
            shared
                .child_watches
                .entry(path.to_string())
                .or_default()
                .push(watch);
        }
        let prefix = format!("{}/", path);
        let names = shared
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, _)| p[prefix.len()..].to_string())
            .collect();
        Ok(names)
    }

    async fn exists(&self, path: &str, watch: Option<WatchSender>) -> Result<bool> {
        let mut shared = self.shared.lock();
        shared.gate(self.id)?;
        if let Some(watch) = watch {
            shared
                .node_watches
                .entry(path.to_string())
                .or_default()
                .push(watch);
        }
        Ok(shared.nodes.contains_key(path))
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.shared.lock().expire(self.id);
    }
}
