//! Cluster-wide reconfiguration sweep.
//!
//! Run by the leader only. A sweep drives every live member through an
//! ordered `check -> off -> on` sequence over its control port and, on
//! all-success, commits the new fingerprint plus a member snapshot to the
//! coordination store:
//!
//! - Phase A probes every member with `/control/check`; any rejection or
//!   unreachable peer aborts the sweep before any state changes.
//! - Phases B and C issue `/control/off` then `/control/on`, serialized by
//!   ascending seq when the hook declares `sequential`, in parallel
//!   otherwise.
//! - Phase D writes the `hash`, `snapshot` and `state` nodes.
//!
//! Members reporting a dead process are skipped silently, as is any member
//! answering HTTP 410 mid-sweep. The member set is fixed when the sweep
//! starts; later membership changes surface as a fresh damped sweep.

use crate::coord::{ClusterPaths, Session, SessionEvent};
use crate::error::{AgentError, Result};
use crate::types::{ClusterStateRecord, ClusterView, PodDescriptor, ProcessState};
use crate::watcher::Snapshot;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Baseline leader-to-peer request timeout.
const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for control requests.
const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Sweep behavior knobs taken from the lifecycle hook.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Serialize phases B and C by ascending seq.
    pub sequential: bool,
    /// Peer teardown deadline.
    pub grace: Duration,
    /// Damper window; the configure deadline derives from it.
    pub damper: Duration,
}

struct Target {
    uuid: String,
    url: String,
}

/// Leader-side sweep executor.
pub struct Driver {
    session: Arc<dyn Session>,
    paths: ClusterPaths,
    options: SweepOptions,
    client: reqwest::Client,
    events: broadcast::Receiver<SessionEvent>,
}

impl Driver {
    pub fn new(session: Arc<dyn Session>, paths: ClusterPaths, options: SweepOptions) -> Self {
        let events = session.events();
        let client = reqwest::Client::builder()
            .connect_timeout(PEER_CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            session,
            paths,
            options,
            client,
            events,
        }
    }

    /// Execute one full sweep against the fixed snapshot and commit
    /// `fingerprint` on success.
    pub async fn sweep(&mut self, snapshot: &Snapshot, fingerprint: &str) -> Result<()> {
        let mut targets: Vec<Target> = Vec::new();
        let mut live: BTreeMap<String, PodDescriptor> = BTreeMap::new();
        let mut ordered: Vec<&PodDescriptor> = snapshot.members.values().collect();
        ordered.sort_by_key(|p| p.seq);
        for pod in ordered {
            if pod.process == ProcessState::Dead {
                debug!(uuid = %pod.uuid, "skipping dead pod");
                continue;
            }
            targets.push(Target {
                uuid: pod.uuid.to_string(),
                url: pod.control_url()?,
            });
            live.insert(pod.uuid.to_string(), pod.clone());
        }

        info!(
            members = targets.len(),
            sequential = self.options.sequential,
            "sweep starting"
        );

        // Phase A: probe. Always parallel; nothing has changed yet so any
        // failure is a clean abort.
        let mut skipped = HashSet::new();
        let replies = self
            .phase("check", &targets, &live, snapshot, PEER_TIMEOUT, false)
            .await?;
        self.collect(replies, &mut skipped, "pre-check")?;
        self.ensure_leading()?;

        // Phase B: tear-down.
        let remaining: Vec<&Target> = targets
            .iter()
            .filter(|t| !skipped.contains(&t.uuid))
            .collect();
        let off_timeout = self.options.grace.mul_f64(1.25).max(PEER_TIMEOUT);
        let replies = self
            .phase_refs("off", &remaining, &live, snapshot, off_timeout, self.options.sequential)
            .await?;
        self.collect(replies, &mut skipped, "tear-down")?;
        self.ensure_leading()?;

        // Phase C: configure-and-run.
        let remaining: Vec<&Target> = targets
            .iter()
            .filter(|t| !skipped.contains(&t.uuid))
            .collect();
        let on_timeout = (self.options.damper * 10).max(PEER_TIMEOUT);
        let replies = self
            .phase_refs("on", &remaining, &live, snapshot, on_timeout, self.options.sequential)
            .await?;
        self.collect(replies, &mut skipped, "configure")?;
        self.ensure_leading()?;

        // Phase D: commit.
        for uuid in &skipped {
            live.remove(uuid);
        }
        self.write(&self.paths.snapshot(), &serde_json::to_vec(&live)?).await?;
        self.write(&self.paths.hash(), fingerprint.as_bytes()).await?;
        let record = ClusterStateRecord {
            last_reconfig_at: chrono::Utc::now(),
            pod_count: live.len(),
            ok: true,
        };
        self.write(&self.paths.state(), &serde_json::to_vec(&record)?).await?;

        info!(pods = live.len(), hash = fingerprint, "sweep committed");
        Ok(())
    }

    fn view_for(
        &self,
        uuid: &str,
        live: &BTreeMap<String, PodDescriptor>,
        snapshot: &Snapshot,
    ) -> ClusterView {
        ClusterView {
            key: uuid.to_string(),
            pods: live.clone(),
            dependencies: snapshot.dependencies.clone(),
        }
    }

    async fn phase(
        &self,
        verb: &str,
        targets: &[Target],
        live: &BTreeMap<String, PodDescriptor>,
        snapshot: &Snapshot,
        timeout: Duration,
        sequential: bool,
    ) -> Result<Vec<(String, u16)>> {
        let refs: Vec<&Target> = targets.iter().collect();
        self.phase_refs(verb, &refs, live, snapshot, timeout, sequential)
            .await
    }

    async fn phase_refs(
        &self,
        verb: &str,
        targets: &[&Target],
        live: &BTreeMap<String, PodDescriptor>,
        snapshot: &Snapshot,
        timeout: Duration,
        sequential: bool,
    ) -> Result<Vec<(String, u16)>> {
        if sequential {
            let mut replies = Vec::with_capacity(targets.len());
            for target in targets.iter().copied() {
                let view = self.view_for(&target.uuid, live, snapshot);
                let code = self.call(target, verb, &view, timeout).await?;
                replies.push((target.uuid.clone(), code));
            }
            Ok(replies)
        } else {
            let calls = targets.iter().copied().map(|target| {
                let view = self.view_for(&target.uuid, live, snapshot);
                async move {
                    let code = self.call(target, verb, &view, timeout).await?;
                    Ok::<_, AgentError>((target.uuid.clone(), code))
                }
            });
            futures::future::try_join_all(calls).await
        }
    }

    async fn call(
        &self,
        target: &Target,
        verb: &str,
        view: &ClusterView,
        timeout: Duration,
    ) -> Result<u16> {
        let url = format!("{}/control/{}", target.url, verb);
        debug!(url = url.as_str(), "control ->");
        let response = self
            .client
            .post(&url)
            .json(view)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| AgentError::PeerUnreachable(format!("{}: {}", url, err)))?;
        let code = response.status().as_u16();
        debug!(url = url.as_str(), code, "control <-");
        Ok(code)
    }

    /// Fold one phase's replies: 410 marks the pod as idling and skips it,
    /// anything else but 200 aborts the sweep.
    fn collect(
        &self,
        replies: Vec<(String, u16)>,
        skipped: &mut HashSet<String>,
        phase: &str,
    ) -> Result<()> {
        for (uuid, code) in replies {
            match code {
                200 => {}
                410 => {
                    debug!(uuid = uuid.as_str(), phase, "pod idling, skipped");
                    skipped.insert(uuid);
                }
                code => {
                    warn!(uuid = uuid.as_str(), code, phase, "pod failed");
                    return Err(AgentError::SweepAborted(format!(
                        "{} failed on pod {} (HTTP {})",
                        phase, uuid, code
                    )));
                }
            }
        }
        Ok(())
    }

    /// Abort when the session degraded under us: the lock is ephemeral, so
    /// any suspension or loss means we can no longer claim leadership.
    fn ensure_leading(&mut self) -> Result<()> {
        loop {
            match self.events.try_recv() {
                Ok(SessionEvent::Suspended) | Ok(SessionEvent::Lost) => {
                    return Err(AgentError::LockLost)
                }
                Ok(SessionEvent::Connected) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(()),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(AgentError::SessionLost)
                }
            }
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.session.create_persistent(path, data, true).await?;
        self.session.set(path, data).await
    }
}
