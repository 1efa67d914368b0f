//! Core data model: pod descriptors and cluster views.
//!
//! A [`PodDescriptor`] is the JSON payload every agent publishes under its
//! registration node. A [`ClusterView`] is the payload the leader sends to
//! each member during a sweep: the full member set plus a snapshot of every
//! declared dependency.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Process state of the supervised child, as exposed through `/info`.
///
/// Transitions are monotonic per run: `stopped -> running -> (dead|failed)`.
/// Leaving `dead` or `failed` requires an explicit control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No child process.
    Stopped,
    /// Child is up.
    Running,
    /// Child exited voluntarily or the pod was killed.
    Dead,
    /// Configuration or the child failed beyond the restart budget.
    Failed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Running => "running",
            ProcessState::Dead => "dead",
            ProcessState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Role of the pod within its cluster, decided by lock ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodRole {
    Leader,
    Follower,
}

impl fmt::Display for PodRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodRole::Leader => write!(f, "leader"),
            PodRole::Follower => write!(f, "follower"),
        }
    }
}

/// Fully qualified cluster key, `namespace.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Qualify a bare cluster name within this key's namespace.
    pub fn sibling(&self, name: &str) -> ClusterKey {
        ClusterKey::new(self.namespace.clone(), name)
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

impl FromStr for ClusterKey {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(ClusterKey::new(namespace, name))
            }
            _ => Err(AgentError::Config(format!(
                "cluster key must be namespace.name, got {:?}",
                s
            ))),
        }
    }
}

impl Serialize for ClusterKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClusterKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Registration payload published by each pod under its cluster path.
///
/// Port keys are the container-exposed TCP ports in string form (JSON object
/// keys), values are the host-remapped counterparts. The map always contains
/// the control port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDescriptor {
    /// Host identifier provided by the binding.
    pub node: String,
    /// Orchestrator-assigned task id.
    pub task: String,
    /// Internal address reachable by peers.
    pub ip: String,
    /// Externally reachable address (may equal `ip`).
    pub public: String,
    /// Container-exposed port -> host-remapped port.
    pub ports: BTreeMap<String, u16>,
    /// Control-port key within `ports`.
    pub port: String,
    /// Orchestrator application name.
    pub application: String,
    /// Fully qualified cluster key.
    pub cluster: ClusterKey,
    /// Supervised child state.
    pub process: ProcessState,
    /// Leader or follower.
    pub state: PodRole,
    /// Stable random id generated once at process start.
    pub uuid: Uuid,
    /// Monotonic counter assigned at first registration, stable for the
    /// lifetime of the agent process.
    pub seq: u64,
}

impl PodDescriptor {
    /// Stable identity of the pod: everything the committed cluster
    /// fingerprint covers. Supervision state (`process`, `state`) is local
    /// and volatile and stays out, otherwise every sweep would invalidate
    /// the hash it just committed.
    pub fn identity(&self) -> impl Serialize + '_ {
        (
            &self.node,
            &self.task,
            &self.ip,
            &self.public,
            &self.ports,
            &self.port,
            &self.application,
            &self.cluster,
            &self.uuid,
            self.seq,
        )
    }

    /// The host-remapped control port, i.e. `ports[port]`.
    pub fn control_port(&self) -> Result<u16> {
        self.ports.get(&self.port).copied().ok_or_else(|| {
            AgentError::Binding(format!("control port {} missing from port map", self.port))
        })
    }

    /// Base URL of the pod's control surface.
    pub fn control_url(&self) -> Result<String> {
        Ok(format!("http://{}:{}", self.ip, self.control_port()?))
    }
}

/// Snapshot of one dependency cluster: its committed hash and members.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencySnapshot {
    /// Last hash committed by the dependency's own leader.
    pub hash: String,
    /// Member descriptors as of that commit, keyed by pod uuid.
    pub pods: BTreeMap<String, PodDescriptor>,
}

/// Cluster description handed to a pod during check and configure.
///
/// `key` identifies the receiving pod within `pods`; `index` is its rank in
/// the seq-ordered member list and is only stable for one configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    /// Uuid of the pod this view was addressed to.
    pub key: String,
    /// Member descriptors keyed by pod uuid.
    pub pods: BTreeMap<String, PodDescriptor>,
    /// Dependency snapshots keyed by dependency cluster name.
    pub dependencies: BTreeMap<String, DependencySnapshot>,
}

impl ClusterView {
    /// Number of member pods.
    pub fn size(&self) -> usize {
        self.pods.len()
    }

    /// Members ordered by ascending `seq`.
    pub fn ordered(&self) -> Vec<&PodDescriptor> {
        let mut pods: Vec<&PodDescriptor> = self.pods.values().collect();
        pods.sort_by_key(|p| p.seq);
        pods
    }

    /// Stable counter of the addressed pod.
    pub fn seq(&self) -> Result<u64> {
        self.pods
            .get(&self.key)
            .map(|p| p.seq)
            .ok_or_else(|| AgentError::Internal(format!("key {} not in member set", self.key)))
    }

    /// Rank of the addressed pod within the seq-ordered member list.
    pub fn index(&self) -> Result<usize> {
        let seq = self.seq()?;
        Ok(self.ordered().iter().take_while(|p| p.seq < seq).count())
    }

    /// Members exposing the requested container port.
    pub fn grep(&self, port: u16) -> Vec<&PodDescriptor> {
        let key = port.to_string();
        self.ordered()
            .into_iter()
            .filter(|p| p.ports.contains_key(&key))
            .collect()
    }

    /// Connection string for a dependency, e.g. `"10.0.0.1:1025,10.0.0.2:1031"`.
    ///
    /// The container port is remapped to whatever the orchestrator allocated
    /// on each dependency pod. Unknown dependencies yield an empty string;
    /// a dependency pod not exposing the port is an error.
    pub fn grep_dependency(&self, dependency: &str, port: u16, public: bool) -> Result<String> {
        let Some(snapshot) = self.dependencies.get(dependency) else {
            return Ok(String::new());
        };

        let key = port.to_string();
        let mut endpoints = Vec::new();
        let mut pods: Vec<&PodDescriptor> = snapshot.pods.values().collect();
        pods.sort_by_key(|p| p.seq);
        for pod in pods {
            let mapped = pod.ports.get(&key).ok_or_else(|| {
                AgentError::Config(format!(
                    "pod from {} not exposing port {}",
                    dependency, port
                ))
            })?;
            let ip = if public { &pod.public } else { &pod.ip };
            endpoints.push(format!("{}:{}", ip, mapped));
        }
        Ok(endpoints.join(","))
    }
}

/// Shell command plus environment overrides returned by `configure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Summary written to the cluster `state` node after each committed sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStateRecord {
    pub last_reconfig_at: chrono::DateTime<chrono::Utc>,
    pub pod_count: usize,
    pub ok: bool,
}
