//! Reactive cluster watching.
//!
//! Run by the leader only. The watcher observes its own cluster's membership
//! (children plus per-pod payload watches) and the `hash` node of every
//! declared dependency. Watch firings do not trigger work directly: each one
//! restarts a damper timer, and only when the timer expires is the current
//! snapshot fingerprinted and compared against the last committed hash. A
//! pod that drops and returns within the damper window therefore causes no
//! sweep at all.
//!
//! Dependency resolution is one hop: only the immediate dependencies' hash
//! nodes are watched. Transitive invalidation cascades naturally because
//! each dependency's own leader rewrites its hash when its members change.

use crate::coord::{ClusterPaths, Session, WatchEvent, WatchSender};
use crate::driver::Driver;
use crate::error::{AgentError, Result};
use crate::lifecycle::Piped;
use crate::types::{ClusterKey, ClusterView, DependencySnapshot, PodDescriptor};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bound on one watch-event processing pass (re-reading membership and
/// dependency state).
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on one probe hook invocation.
const PROBE_DEADLINE: Duration = Duration::from_secs(30);

/// Leader's view of the world, fixed when a sweep starts.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Registered member descriptors keyed by pod uuid.
    pub members: BTreeMap<String, PodDescriptor>,
    /// Dependency snapshots keyed by dependency cluster name.
    pub dependencies: BTreeMap<String, DependencySnapshot>,
}

/// SHA-1 fingerprint over the sorted member descriptors and the sorted
/// dependency hashes. Two identical snapshots always fingerprint equal,
/// which is what makes flap suppression work.
pub fn fingerprint(snapshot: &Snapshot) -> Result<String> {
    let mut hasher = Sha1::new();
    for (uuid, descriptor) in &snapshot.members {
        hasher.update(uuid.as_bytes());
        hasher.update(serde_json::to_vec(&descriptor.identity())?);
    }
    for (name, dependency) in &snapshot.dependencies {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(dependency.hash.as_bytes());
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect())
}

/// Leader-side membership and dependency watcher.
pub struct Watcher {
    session: Arc<dyn Session>,
    paths: ClusterPaths,
    dependencies: BTreeMap<String, ClusterPaths>,
    damper: Duration,
    driver: Driver,
    hook: Arc<dyn Piped>,
    uuid: String,
    status: watch::Sender<String>,
}

impl Watcher {
    /// Dependencies come from the hook as bare cluster names, resolved
    /// within the leader's own namespace. `uuid` identifies the leader in
    /// the views handed to its probe.
    pub fn new(
        session: Arc<dyn Session>,
        cluster: &ClusterKey,
        hook: Arc<dyn Piped>,
        uuid: String,
        status: watch::Sender<String>,
        driver: Driver,
    ) -> Self {
        let dependencies = hook
            .depends_on()
            .iter()
            .map(|name| (name.clone(), ClusterPaths::new(&cluster.sibling(name))))
            .collect();
        Self {
            session,
            paths: ClusterPaths::new(cluster),
            dependencies,
            damper: hook.damper(),
            driver,
            hook,
            uuid,
            status,
        }
    }

    /// Watch until the session degrades or the surrounding task is dropped.
    pub async fn run(mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut armed: HashSet<String> = HashSet::new();

        let mut snapshot = self.refresh(&tx, &mut armed).await?;
        let mut deadline = Some(Instant::now() + self.damper);
        let mut last_applied: Option<ClusterView> = None;
        let mut next_probe = Instant::now() + self.hook.probe_every();
        info!(
            dependencies = self.dependencies.len(),
            damper_ms = self.damper.as_millis() as u64,
            "watching cluster"
        );

        loop {
            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        return Err(AgentError::Internal("watch channel closed".into()));
                    };
                    armed.remove(&watch_key(&event));
                    snapshot = self.refresh(&tx, &mut armed).await?;
                    deadline = Some(Instant::now() + self.damper);
                    debug!("change spotted, damper restarted");
                }
                _ = expiry => {
                    deadline = None;
                    let current = fingerprint(&snapshot)?;
                    let committed = self.committed().await?;
                    if current == committed {
                        debug!("fingerprint unchanged, sweep suppressed");
                        last_applied = Some(self.view_of(&snapshot));
                        continue;
                    }
                    match self.driver.sweep(&snapshot, &current).await {
                        Ok(()) => {
                            last_applied = Some(self.view_of(&snapshot));
                            next_probe = Instant::now();
                        }
                        Err(AgentError::LockLost) => return Err(AgentError::LockLost),
                        Err(err) if err.is_retryable() => {
                            warn!(error = %err, "sweep failed, retrying after damper");
                            snapshot = self.refresh(&tx, &mut armed).await?;
                            deadline = Some(Instant::now() + self.damper);
                        }
                        Err(err) => return Err(err),
                    }
                }
                _ = tokio::time::sleep_until(next_probe) => {
                    next_probe = Instant::now() + self.hook.probe_every();
                    // No probing while a reconfiguration is pending.
                    if deadline.is_none() {
                        if let Some(view) = last_applied.clone() {
                            self.run_probe(view).await;
                        }
                    }
                }
            }
        }
    }

    fn view_of(&self, snapshot: &Snapshot) -> ClusterView {
        ClusterView {
            key: self.uuid.clone(),
            pods: snapshot.members.clone(),
            dependencies: snapshot.dependencies.clone(),
        }
    }

    /// Invoke the hook's probe off-thread and publish the outcome as the
    /// pod status.
    async fn run_probe(&self, view: ClusterView) {
        let hook = Arc::clone(&self.hook);
        let handle = tokio::task::spawn_blocking(move || hook.probe(&view));
        let outcome = match tokio::time::timeout(PROBE_DEADLINE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(AgentError::HookCrash(join.to_string())),
            Err(_) => Err(AgentError::Timeout("probe deadline".into())),
        };
        match outcome {
            Ok(snippet) => {
                let snippet = snippet.unwrap_or_default();
                if !snippet.is_empty() {
                    debug!(status = snippet.as_str(), "probe");
                }
                let _ = self.status.send(snippet);
            }
            Err(err) => {
                warn!(error = %err, "probe failed");
                let _ = self.status.send(format!("* {}", err));
            }
        }
    }

    /// Last committed fingerprint, empty when no sweep ever committed.
    async fn committed(&self) -> Result<String> {
        match self.session.get(&self.paths.hash()).await {
            Ok((data, _)) => Ok(String::from_utf8_lossy(&data).into_owned()),
            Err(AgentError::NodeNotFound(_)) => Ok(String::new()),
            Err(err) => Err(err),
        }
    }

    /// Re-read membership and dependency state, re-arming whichever one-shot
    /// watches have fired (or never been set). Bounded so a wedged store
    /// cannot stall the leader silently.
    async fn refresh(
        &self,
        tx: &WatchSender,
        armed: &mut HashSet<String>,
    ) -> Result<Snapshot> {
        match tokio::time::timeout(REFRESH_TIMEOUT, self.scan(tx, armed)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout("membership refresh".into())),
        }
    }

    async fn scan(&self, tx: &WatchSender, armed: &mut HashSet<String>) -> Result<Snapshot> {
        let mut members = BTreeMap::new();
        let pods_path = self.paths.pods();
        let names = self
            .session
            .children(&pods_path, arm(armed, format!("c:{}", pods_path), tx))
            .await?;

        for name in names {
            let path = format!("{}/{}", pods_path, name);
            // Payload rewrites (process or role changes) must also wake us.
            self.session
                .exists(&path, arm(armed, format!("n:{}", path), tx))
                .await?;
            match self.session.get(&path).await {
                Ok((data, _)) => match serde_json::from_slice::<PodDescriptor>(&data) {
                    Ok(descriptor) => {
                        members.insert(descriptor.uuid.to_string(), descriptor);
                    }
                    Err(err) => warn!(path = path.as_str(), error = %err, "bad registration payload"),
                },
                // The pod vanished between the listing and the read.
                Err(AgentError::NodeNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let mut dependencies = BTreeMap::new();
        for (name, paths) in &self.dependencies {
            let hash_path = paths.hash();
            let mut snapshot = DependencySnapshot::default();
            if self
                .session
                .exists(&hash_path, arm(armed, format!("n:{}", hash_path), tx))
                .await?
            {
                if let Ok((data, _)) = self.session.get(&hash_path).await {
                    snapshot.hash = String::from_utf8_lossy(&data).into_owned();
                }
            }
            if let Ok((data, _)) = self.session.get(&paths.snapshot()).await {
                snapshot.pods = serde_json::from_slice(&data).unwrap_or_default();
            }
            dependencies.insert(name.clone(), snapshot);
        }

        Ok(Snapshot {
            members,
            dependencies,
        })
    }
}

fn arm(armed: &mut HashSet<String>, key: String, tx: &WatchSender) -> Option<WatchSender> {
    if armed.insert(key) {
        Some(tx.clone())
    } else {
        None
    }
}

fn watch_key(event: &WatchEvent) -> String {
    match event {
        WatchEvent::Children { path } => format!("c:{}", path),
        WatchEvent::Node { path } => format!("n:{}", path),
    }
}
