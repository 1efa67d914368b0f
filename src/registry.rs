//! Pod registration.
//!
//! The registry owns the authoritative copy of this pod's descriptor. It
//! publishes it as an ephemeral sequential node under the cluster path,
//! rewrites the payload whenever the lifecycle or the election mutate
//! `process`/`state`, and mirrors every revision on a watch channel for the
//! control server's `/info`.
//!
//! The descriptor's `seq` is assigned by the first registration and kept for
//! the lifetime of the agent process: a session loss re-registers under a
//! fresh node but the payload keeps its original counter, so transient flaps
//! do not change the committed cluster fingerprint.

use crate::coord::{ClusterPaths, Session};
use crate::error::Result;
use crate::retry::RetryConfig;
use crate::types::{PodDescriptor, PodRole, ProcessState};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Commands accepted by the registry actor.
pub enum RegistryCmd {
    /// Update the supervised child state.
    Process(ProcessState),
    /// Update the election role.
    Role(PodRole),
    /// (Re-)register under a fresh session; replies with the stable seq.
    Attach(Arc<dyn Session>, oneshot::Sender<Result<u64>>),
    /// Forget the current session (it was lost or reset).
    Detach,
}

/// Registry actor state.
pub struct Registry {
    paths: ClusterPaths,
    descriptor: PodDescriptor,
    seq_assigned: bool,
    session: Option<Arc<dyn Session>>,
    node_path: Option<String>,
    info: watch::Sender<PodDescriptor>,
}

impl Registry {
    /// Build the actor plus the `/info` watch receiver.
    pub fn new(
        descriptor: PodDescriptor,
        paths: ClusterPaths,
    ) -> (Self, watch::Receiver<PodDescriptor>) {
        let (info, info_rx) = watch::channel(descriptor.clone());
        (
            Self {
                paths,
                descriptor,
                seq_assigned: false,
                session: None,
                node_path: None,
                info,
            },
            info_rx,
        )
    }

    /// Actor loop.
    pub async fn run(mut self, mut rx: mpsc::Receiver<RegistryCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RegistryCmd::Process(process) => {
                    if self.descriptor.process != process {
                        self.descriptor.process = process;
                        self.publish().await;
                    }
                }
                RegistryCmd::Role(role) => {
                    if self.descriptor.state != role {
                        self.descriptor.state = role;
                        self.publish().await;
                    }
                }
                RegistryCmd::Attach(session, reply) => {
                    let result = self.register(session).await;
                    let _ = reply.send(result);
                }
                RegistryCmd::Detach => {
                    self.session = None;
                    self.node_path = None;
                }
            }
        }
    }

    /// Create the registration node, retrying transient connection loss.
    async fn register(&mut self, session: Arc<dyn Session>) -> Result<u64> {
        let paths = self.paths.clone();
        let descriptor = self.descriptor.clone();
        let stem = paths.pod_stem();

        let node_path = RetryConfig::default()
            .execute(|| {
                let session = Arc::clone(&session);
                let descriptor = descriptor.clone();
                let paths = paths.clone();
                let stem = stem.clone();
                async move {
                    // The hash node must exist before anybody watches it.
                    session.create_persistent(&paths.hash(), b"", true).await?;
                    let payload = serde_json::to_vec(&descriptor)?;
                    session.create_ephemeral_sequential(&stem, &payload).await
                }
            })
            .await?;

        if !self.seq_assigned {
            if let Some(seq) = crate::coord::sequence_of(&node_path) {
                self.descriptor.seq = seq;
                self.seq_assigned = true;
            }
        }

        info!(
            node = node_path.as_str(),
            seq = self.descriptor.seq,
            uuid = %self.descriptor.uuid,
            "pod registered"
        );

        self.session = Some(session);
        self.node_path = Some(node_path);
        // Rewrite with the final seq (and whatever mutated while detached).
        self.publish().await;
        Ok(self.descriptor.seq)
    }

    /// Push the current descriptor to the store and the `/info` channel.
    async fn publish(&mut self) {
        let _ = self.info.send(self.descriptor.clone());

        let (Some(session), Some(path)) = (&self.session, &self.node_path) else {
            return;
        };
        let payload = match serde_json::to_vec(&self.descriptor) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "descriptor serialization failed");
                return;
            }
        };
        match session.set(path, &payload).await {
            Ok(()) => debug!(path = path.as_str(), "descriptor rewritten"),
            Err(err) => {
                // The agent loop will re-attach after the session recovers.
                warn!(error = %err, "descriptor rewrite failed, detaching");
                self.session = None;
                self.node_path = None;
            }
        }
    }
}
