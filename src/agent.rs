//! Agent assembly and main loop.
//!
//! Boots the long-lived actors (registry, lifecycle, control server), then
//! drives the coordination cycle: connect, register, campaign for the lock,
//! watch while leading. A lost session tears the leader stack down and
//! re-enters the cycle from cold; consecutive connection failures beyond the
//! retry budget exit the agent with code 2 so the orchestrator can recycle
//! the container.

use crate::config::AgentConfig;
use crate::coord::{ClusterPaths, Session, SessionEvent, Store};
use crate::driver::{Driver, SweepOptions};
use crate::election::Election;
use crate::error::{AgentError, Result};
use crate::lifecycle::{self, AgentEvent, ControlRequest, ControlVerb, Lifecycle, Piped};
use crate::logbuf::LogBuffer;
use crate::registry::{Registry, RegistryCmd};
use crate::retry::RetryConfig;
use crate::server::{self, ServerState};
use crate::shutdown::Shutdown;
use crate::types::{ClusterKey, PodDescriptor, PodRole};
use crate::watcher::Watcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Orderly exit (signal or full shutdown).
pub const EXIT_OK: i32 = 0;
/// Fatal binding error (set by the binary before the agent even starts).
pub const EXIT_BINDING: i32 = 1;
/// Coordination loss beyond the retry budget.
pub const EXIT_COORDINATION: i32 = 2;

/// Delay before re-entering election after a transient leader failure.
const RELEAD_DELAY: Duration = Duration::from_secs(1);

enum Outcome {
    Reconnect,
    Exit(i32),
}

/// One pod agent.
pub struct Agent {
    config: AgentConfig,
    descriptor: PodDescriptor,
    hook: Arc<dyn Piped>,
    store: Arc<dyn Store>,
    logs: LogBuffer,
    shutdown: Shutdown,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        descriptor: PodDescriptor,
        hook: Arc<dyn Piped>,
        store: Arc<dyn Store>,
        logs: LogBuffer,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            descriptor,
            hook,
            store,
            logs,
            shutdown,
        }
    }

    /// Run until an exit condition; returns the process exit code.
    pub async fn run(self) -> Result<i32> {
        let (listener, bound) = server::bind(self.config.control_port).await?;
        let mut descriptor = self.descriptor.clone();
        if self.config.control_port == 0 {
            // Tests and ad-hoc runs bind an ephemeral port; fix the
            // descriptor up so peers can actually reach us.
            descriptor.ports.remove("0");
            descriptor.port = bound.to_string();
            descriptor.ports.entry(bound.to_string()).or_insert(bound);
        }

        info!(
            cluster = %self.config.cluster,
            port = bound,
            uuid = %descriptor.uuid,
            "starting pod agent"
        );

        let paths = ClusterPaths::new(&self.config.cluster);
        let uuid = descriptor.uuid.to_string();
        let (control_tx, control_rx) = lifecycle::control_channel();
        let (registry_tx, registry_rx) = mpsc::channel(32);
        let (agent_tx, mut agent_rx) = mpsc::channel(8);
        let (reset_tx, mut reset_rx) = mpsc::channel(8);
        // Runtime hints: the leader's probe outcome and the last sanity
        // check's metrics, served by /info but never registered.
        let (status_tx, status_rx) = watch::channel(String::new());
        let (metrics_tx, metrics_rx) = watch::channel(serde_json::Value::Null);

        let (registry, info_rx) = Registry::new(descriptor, paths);
        tokio::spawn(registry.run(registry_rx));

        let executor = Lifecycle::new(
            Arc::clone(&self.hook),
            self.config.autostart,
            registry_tx.clone(),
            agent_tx,
            info_rx.clone(),
            metrics_tx,
        );
        tokio::spawn(executor.run(control_rx));

        let state = ServerState {
            control: control_tx.clone(),
            info: info_rx,
            depends_on: self.hook.depends_on(),
            logs: self.logs.clone(),
            reset: reset_tx,
            status: status_rx,
            metrics: metrics_rx,
        };
        tokio::spawn(async move {
            if let Err(err) = server::serve(listener, state).await {
                error!(error = %err, "control server failed");
            }
        });

        let backoff = RetryConfig::coordination(self.config.retry_budget);
        let mut failures: u32 = 0;

        loop {
            if self.shutdown.is_tripped() {
                return Ok(EXIT_OK);
            }

            // Connect and register; both count against the retry budget.
            let session = match self.store.connect(self.config.session_timeout).await {
                Ok(session) => session,
                Err(err) => {
                    failures += 1;
                    if failures >= self.config.retry_budget {
                        error!(error = %err, "coordination unreachable, giving up");
                        return Ok(EXIT_COORDINATION);
                    }
                    let delay = backoff.delay_for_attempt(failures);
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "connect failed");
                    if self.pause(delay).await {
                        return Ok(EXIT_OK);
                    }
                    continue;
                }
            };

            let (reply, registered) = oneshot::channel();
            let _ = registry_tx
                .send(RegistryCmd::Attach(Arc::clone(&session), reply))
                .await;
            match registered.await {
                Ok(Ok(seq)) => {
                    failures = 0;
                    debug!(seq, session = session.id(), "registered");
                }
                outcome => {
                    failures += 1;
                    warn!(?outcome, "registration failed");
                    session.close().await;
                    if failures >= self.config.retry_budget {
                        return Ok(EXIT_COORDINATION);
                    }
                    let delay = backoff.delay_for_attempt(failures);
                    if self.pause(delay).await {
                        return Ok(EXIT_OK);
                    }
                    continue;
                }
            }

            let outcome = self
                .supervise_session(
                    Arc::clone(&session),
                    &registry_tx,
                    &control_tx,
                    &mut agent_rx,
                    &mut reset_rx,
                    uuid.clone(),
                    status_tx.clone(),
                )
                .await;
            let _ = registry_tx.send(RegistryCmd::Detach).await;
            session.close().await;

            match outcome {
                Outcome::Reconnect => continue,
                Outcome::Exit(code) => return Ok(code),
            }
        }
    }

    /// Watch one session until it degrades or the agent is asked to stop.
    #[allow(clippy::too_many_arguments)]
    async fn supervise_session(
        &self,
        session: Arc<dyn Session>,
        registry_tx: &mpsc::Sender<RegistryCmd>,
        control_tx: &mpsc::Sender<ControlRequest>,
        agent_rx: &mut mpsc::Receiver<AgentEvent>,
        reset_rx: &mut mpsc::Receiver<()>,
        uuid: String,
        status: watch::Sender<String>,
    ) -> Outcome {
        let mut events = session.events();
        let mut lead = tokio::spawn(lead_loop(
            Arc::clone(&session),
            self.config.cluster.clone(),
            Arc::clone(&self.hook),
            registry_tx.clone(),
            uuid,
            status,
        ));

        let outcome = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(SessionEvent::Lost) | Err(broadcast::error::RecvError::Closed) => {
                        warn!("session lost, rebuilding from scratch");
                        break Outcome::Reconnect;
                    }
                    Ok(SessionEvent::Suspended) => debug!("session suspended"),
                    Ok(SessionEvent::Connected) => debug!("session restored"),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
                _ = &mut lead => {
                    // The leader stack only gives up on session expiry.
                    break Outcome::Reconnect;
                }
                Some(()) = reset_rx.recv() => {
                    info!("reset requested, dropping session");
                    break Outcome::Reconnect;
                }
                Some(event) = agent_rx.recv() => match event {
                    AgentEvent::FullShutdown => break Outcome::Exit(EXIT_OK),
                },
                _ = self.shutdown.tripped() => {
                    // Tear the child down through the lifecycle before dying.
                    let (reply, done) = oneshot::channel();
                    let _ = control_tx
                        .send(ControlRequest {
                            verb: ControlVerb::Off,
                            body: None,
                            reply,
                        })
                        .await;
                    let _ = done.await;
                    break Outcome::Exit(EXIT_OK);
                }
            }
        };

        lead.abort();
        outcome
    }

    /// Sleep, returning true when shutdown fired meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.tripped() => true,
        }
    }
}

/// Campaign for the lock and keep watching while leading. Transient
/// failures (suspensions, aborted sweeps mid-demotion) re-enter election on
/// the same session; the task only ends when the session is beyond repair.
async fn lead_loop(
    session: Arc<dyn Session>,
    cluster: ClusterKey,
    hook: Arc<dyn Piped>,
    registry_tx: mpsc::Sender<RegistryCmd>,
    uuid: String,
    status: watch::Sender<String>,
) {
    let paths = ClusterPaths::new(&cluster);
    let mut election = Election::new(Arc::clone(&session), paths.clone());

    loop {
        match election.acquire().await {
            Ok(()) => {}
            Err(AgentError::SessionLost) => return,
            Err(err) if err.is_retryable() => {
                debug!(error = %err, "election interrupted, retrying");
                tokio::time::sleep(RELEAD_DELAY).await;
                continue;
            }
            Err(err) => {
                debug!(error = %err, "election over, session gone");
                return;
            }
        }

        let _ = registry_tx.send(RegistryCmd::Role(PodRole::Leader)).await;
        let options = SweepOptions {
            sequential: hook.sequential(),
            grace: hook.grace(),
            damper: hook.damper(),
        };
        let driver = Driver::new(Arc::clone(&session), paths.clone(), options);
        let watcher = Watcher::new(
            Arc::clone(&session),
            &cluster,
            Arc::clone(&hook),
            uuid.clone(),
            status.clone(),
            driver,
        );

        let result = watcher.run().await;
        let _ = registry_tx.send(RegistryCmd::Role(PodRole::Follower)).await;
        // The status snippet is a leader-side assessment; clear it on the
        // way down.
        let _ = status.send(String::new());

        match result {
            Err(AgentError::SessionLost) => return,
            Err(AgentError::LockLost) | Err(AgentError::Unreachable(_)) => {
                warn!("leadership interrupted, re-entering election");
                tokio::time::sleep(RELEAD_DELAY).await;
            }
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "watcher failed, re-entering election");
                tokio::time::sleep(RELEAD_DELAY).await;
            }
            Err(err) => {
                debug!(error = %err, "leader stack done");
                return;
            }
            Ok(()) => return,
        }
    }
}
