//! Shared test harness: spawns full agents against one in-process
//! coordination store and talks to them over their real control ports.

use ochopod::agent::Agent;
use ochopod::config::AgentConfig;
use ochopod::coord::{ClusterPaths, MemoryStore, Store};
use ochopod::error::Result;
use ochopod::lifecycle::{Piped, Reactive};
use ochopod::logbuf::LogBuffer;
use ochopod::shutdown::Shutdown;
use ochopod::types::{ClusterKey, ClusterView, CommandSpec, PodDescriptor, PodRole, ProcessState};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Hook used by the scenario tests: supervises a command and records what
/// the leader asked of it.
pub struct TestHook {
    pub exec: String,
    pub shell: bool,
    pub damper: Duration,
    pub grace: Duration,
    pub depends_on: Vec<String>,
    pub checks: u32,
    pub check_every: Duration,
    pub probe_every: Duration,
    /// Status snippet the probe reports, when set.
    pub probe_status: Option<String>,
    /// Metrics dict the sanity check reports, when set.
    pub metrics: Option<Value>,
    /// Number of configure invocations.
    pub configured: AtomicU32,
    /// Number of probe invocations.
    pub probed: AtomicU32,
    /// Cluster size seen by the most recent configure.
    pub last_size: AtomicUsize,
    /// When set, can_configure vetoes the next sweep.
    pub reject: std::sync::atomic::AtomicBool,
}

impl TestHook {
    pub fn new(exec: &str, damper: Duration) -> Arc<Self> {
        Arc::new(Self::template(exec, damper))
    }

    pub fn with_depends_on(exec: &str, damper: Duration, depends_on: Vec<String>) -> Arc<Self> {
        let mut hook = Self::template(exec, damper);
        hook.depends_on = depends_on;
        Arc::new(hook)
    }

    pub fn with_checks(exec: &str, damper: Duration, checks: u32) -> Arc<Self> {
        let mut hook = Self::template(exec, damper);
        hook.checks = checks;
        Arc::new(hook)
    }

    pub fn with_probe(
        exec: &str,
        damper: Duration,
        status: &str,
        probe_every: Duration,
    ) -> Arc<Self> {
        let mut hook = Self::template(exec, damper);
        hook.probe_status = Some(status.to_string());
        hook.probe_every = probe_every;
        Arc::new(hook)
    }

    pub fn with_metrics(
        exec: &str,
        damper: Duration,
        check_every: Duration,
        metrics: Value,
    ) -> Arc<Self> {
        let mut hook = Self::template(exec, damper);
        hook.check_every = check_every;
        hook.metrics = Some(metrics);
        Arc::new(hook)
    }

    fn template(exec: &str, damper: Duration) -> Self {
        Self {
            exec: exec.to_string(),
            shell: true,
            damper,
            grace: Duration::from_secs(5),
            depends_on: Vec::new(),
            checks: 3,
            check_every: Duration::from_secs(60),
            probe_every: Duration::from_secs(60),
            probe_status: None,
            metrics: None,
            configured: AtomicU32::new(0),
            probed: AtomicU32::new(0),
            last_size: AtomicUsize::new(0),
            reject: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn configure_count(&self) -> u32 {
        self.configured.load(Ordering::SeqCst)
    }
}

impl Reactive for TestHook {
    fn damper(&self) -> Duration {
        self.damper
    }

    fn depends_on(&self) -> Vec<String> {
        self.depends_on.clone()
    }

    fn grace(&self) -> Duration {
        self.grace
    }

    fn probe_every(&self) -> Duration {
        self.probe_every
    }

    fn can_configure(&self, _cluster: &ClusterView) -> Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ochopod::AgentError::HookRejection("not ready".into()));
        }
        Ok(())
    }

    fn probe(&self, _cluster: &ClusterView) -> Result<Option<String>> {
        self.probed.fetch_add(1, Ordering::SeqCst);
        Ok(self.probe_status.clone())
    }
}

impl Piped for TestHook {
    fn checks(&self) -> u32 {
        self.checks
    }

    fn check_every(&self) -> Duration {
        self.check_every
    }

    fn shell(&self) -> bool {
        self.shell
    }

    fn configure(&self, cluster: &ClusterView) -> Result<CommandSpec> {
        self.configured.fetch_add(1, Ordering::SeqCst);
        self.last_size.store(cluster.size(), Ordering::SeqCst);
        Ok(CommandSpec::new(self.exec.clone()))
    }

    fn sanity_check(&self, _pid: u32) -> Result<Option<Value>> {
        Ok(self.metrics.clone())
    }
}

/// A spawned agent plus the handles the tests need.
pub struct PodHandle {
    pub uuid: Uuid,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<i32>>,
}

/// Spawn a complete agent on an ephemeral control port.
pub fn spawn_pod(store: &MemoryStore, cluster: &str, hook: Arc<dyn Piped>) -> PodHandle {
    let key: ClusterKey = cluster.parse().unwrap();
    let config = AgentConfig {
        cluster: key.clone(),
        application: "test".to_string(),
        control_port: 0,
        endpoints: vec!["in-process".to_string()],
        debug: false,
        autostart: true,
        session_timeout: Duration::from_secs(5),
        retry_budget: 4,
    };

    let uuid = Uuid::new_v4();
    let mut ports = BTreeMap::new();
    ports.insert("0".to_string(), 0);
    let descriptor = PodDescriptor {
        node: "test-host".to_string(),
        task: format!("task-{}", uuid),
        ip: "127.0.0.1".to_string(),
        public: "127.0.0.1".to_string(),
        ports,
        port: "0".to_string(),
        application: "test".to_string(),
        cluster: key,
        process: ProcessState::Stopped,
        state: PodRole::Follower,
        uuid,
        seq: 0,
    };

    let shutdown = Shutdown::new();
    let agent = Agent::new(
        config,
        descriptor,
        hook,
        Arc::new(store.clone()),
        LogBuffer::new(),
        shutdown.clone(),
    );
    let task = tokio::spawn(agent.run());
    PodHandle {
        uuid,
        shutdown,
        task,
    }
}

/// Registered members of a cluster: `(node path, descriptor)` sorted by seq.
pub async fn members(store: &MemoryStore, cluster: &str) -> Vec<(String, PodDescriptor)> {
    let key: ClusterKey = cluster.parse().unwrap();
    let paths = ClusterPaths::new(&key);
    let session = store.connect(Duration::from_secs(5)).await.unwrap();
    let names = session.children(&paths.pods(), None).await.unwrap();

    let mut pods = Vec::new();
    for name in names {
        let path = format!("{}/{}", paths.pods(), name);
        if let Ok((data, _)) = session.get(&path).await {
            if let Ok(descriptor) = serde_json::from_slice::<PodDescriptor>(&data) {
                pods.push((path, descriptor));
            }
        }
    }
    session.close().await;
    pods.sort_by_key(|(_, d)| d.seq);
    pods
}

/// Committed cluster hash, if any sweep ever completed.
pub fn committed_hash(store: &MemoryStore, cluster: &str) -> Option<String> {
    let key: ClusterKey = cluster.parse().unwrap();
    let paths = ClusterPaths::new(&key);
    store
        .peek(&paths.hash())
        .filter(|data| !data.is_empty())
        .map(|data| String::from_utf8_lossy(&data).into_owned())
}

/// Poll until `predicate` holds over the member list, panicking after
/// `deadline`.
pub async fn wait_for<F>(
    store: &MemoryStore,
    cluster: &str,
    deadline: Duration,
    what: &str,
    predicate: F,
) -> Vec<(String, PodDescriptor)>
where
    F: Fn(&[(String, PodDescriptor)]) -> bool,
{
    let started = std::time::Instant::now();
    loop {
        let pods = members(store, cluster).await;
        if predicate(&pods) {
            return pods;
        }
        if started.elapsed() > deadline {
            panic!("timed out waiting for {}: {:?}", what, pods);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until the committed hash satisfies `predicate`.
pub async fn wait_for_hash<F>(
    store: &MemoryStore,
    cluster: &str,
    deadline: Duration,
    what: &str,
    predicate: F,
) -> String
where
    F: Fn(Option<&str>) -> bool,
{
    let started = std::time::Instant::now();
    loop {
        let hash = committed_hash(store, cluster);
        if predicate(hash.as_deref()) {
            return hash.unwrap_or_default();
        }
        if started.elapsed() > deadline {
            panic!("timed out waiting for {}: {:?}", what, hash);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// POST a control request straight to a pod.
pub async fn control(pod: &PodDescriptor, verb: &str, body: Option<Value>) -> (u16, Value) {
    post(pod, &format!("/control/{}", verb), body).await
}

/// POST to any endpoint on a pod's control port.
pub async fn post(pod: &PodDescriptor, path: &str, body: Option<Value>) -> (u16, Value) {
    let url = format!("{}{}", pod.control_url().unwrap(), path);
    let client = reqwest::Client::new();
    let mut request = client.post(&url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await.unwrap();
    let status = response.status().as_u16();
    let body = response.json().await.unwrap_or(Value::Null);
    (status, body)
}

/// Leader pod of a cluster, by registered role.
pub fn leader_of(pods: &[(String, PodDescriptor)]) -> Option<PodDescriptor> {
    pods.iter()
        .map(|(_, d)| d)
        .find(|d| d.state == PodRole::Leader)
        .cloned()
}

/// True when every member runs and exactly one leads.
pub fn converged(pods: &[(String, PodDescriptor)], size: usize) -> bool {
    pods.len() == size
        && pods.iter().all(|(_, d)| d.process == ProcessState::Running)
        && pods.iter().filter(|(_, d)| d.state == PodRole::Leader).count() == 1
}
