//! Pod lifecycle: hook contract and control state machine.
//!
//! The lifecycle actor owns the supervised child (through
//! [`supervisor::Supervisor`]) and is the only place control requests are
//! executed: the HTTP server funnels every `/control/*` call into one mpsc
//! channel, so concurrent requests queue and transitions never race.
//!
//! States: `Idle -> Checking -> Stopping -> Configuring -> Running -> Dead`,
//! with `Failed` reachable from a crashing configure hook or an exhausted
//! restart budget. `Dead` is terminal: an explicitly killed pod answers
//! HTTP 410 forever and sweeps skip it. `Failed` is left by an explicit
//! `/control/on`, which re-attempts configuration from scratch.

pub mod supervisor;

use crate::error::{AgentError, Result};
use crate::registry::RegistryCmd;
use crate::retry::RetryConfig;
use crate::types::{ClusterView, CommandSpec, PodDescriptor, ProcessState};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{Supervisor, SupervisorEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Deadline for quick hooks (pre-check, sanity check, signal).
const QUICK_HOOK_DEADLINE: Duration = Duration::from_secs(30);

/// Clustering behavior of a pod. Every setting has a sensible default; a
/// minimal hook overrides nothing.
pub trait Reactive: Send + Sync + 'static {
    /// How long the leader waits after spotting changes before configuring.
    fn damper(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Clusters (same namespace) whose committed hash retriggers ours.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Exit the whole agent once the child has been torn down by an off
    /// request, terminating the container.
    fn full_shutdown(&self) -> bool {
        false
    }

    /// How long a child gets between tear-down and SIGKILL.
    fn grace(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Serialize leader control requests by ascending seq.
    fn sequential(&self) -> bool {
        false
    }

    /// Delay between two leader probes.
    fn probe_every(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Veto an upcoming configuration, e.g. when a dependency is not ready.
    /// An error is reported to the leader as HTTP 406 and the sweep is
    /// re-attempted after the damper.
    fn can_configure(&self, _cluster: &ClusterView) -> Result<()> {
        Ok(())
    }

    /// Periodic cluster health assessment, run by the leader against the
    /// last applied topology. The returned snippet becomes the pod's
    /// `status` as served by `/info`; an error sets a failure status
    /// without touching the cluster.
    fn probe(&self, _cluster: &ClusterView) -> Result<Option<String>> {
        Ok(None)
    }

    /// Out-of-band operation invoked by `/control/signal`. Whatever is
    /// returned goes back to the caller as JSON.
    fn signaled(&self, _body: Value) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// A pod owning an underlying subprocess. `configure` is the only mandatory
/// callback.
pub trait Piped: Reactive {
    /// Failed sanity checks (or crash restarts) tolerated before giving up.
    fn checks(&self) -> u32 {
        3
    }

    /// Delay between two sanity checks.
    fn check_every(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Working directory for the child.
    fn cwd(&self) -> Option<PathBuf> {
        None
    }

    /// Interpret the command line through `/bin/sh -c`.
    fn shell(&self) -> bool {
        false
    }

    /// Reconfigure on every leader request instead of only when the
    /// dependency section of the snapshot changed.
    fn strict(&self) -> bool {
        false
    }

    /// Once-only setup before the first configuration.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Produce the command to run for the given cluster topology.
    fn configure(&self, cluster: &ClusterView) -> Result<CommandSpec>;

    /// Periodic health probe; an error counts against the restart budget.
    /// A returned dict becomes the pod's `metrics` as served by `/info`;
    /// `None` keeps the previous metrics.
    fn sanity_check(&self, _pid: u32) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Ask the child to go down. The default sends SIGTERM; the supervisor
    /// escalates to SIGKILL after the grace period regardless.
    fn tear_down(&self, pid: u32) -> Result<()> {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(AgentError::Subprocess(format!(
                "SIGTERM to {} failed: {}",
                pid,
                std::io::Error::last_os_error()
            )))
        }
    }

    /// Last call before the pod goes dead.
    fn finalize(&self) {}
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodState {
    Idle,
    Checking,
    Stopping,
    Configuring,
    Running,
    Dead,
    Failed,
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodState::Idle => "idle",
            PodState::Checking => "checking",
            PodState::Stopping => "stopping",
            PodState::Configuring => "configuring",
            PodState::Running => "running",
            PodState::Dead => "dead",
            PodState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Control verbs accepted over the control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVerb {
    On,
    Off,
    Check,
    Kill,
    Signal,
}

/// One queued control request.
pub struct ControlRequest {
    pub verb: ControlVerb,
    pub body: Option<Value>,
    pub reply: oneshot::Sender<ControlResponse>,
}

/// Status code plus JSON body handed back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub status: u16,
    pub body: Value,
}

impl ControlResponse {
    fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// Out-of-band notifications to the agent main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// The hook requested a container shutdown after teardown.
    FullShutdown,
}

/// The lifecycle actor.
pub struct Lifecycle {
    hook: Arc<dyn Piped>,
    state: PodState,
    enabled: bool,
    initialized: bool,
    supervisor: Supervisor,
    backoff: RetryConfig,
    last_view: Option<ClusterView>,
    last_command: Option<CommandSpec>,
    registry: mpsc::Sender<RegistryCmd>,
    agent_events: mpsc::Sender<AgentEvent>,
    info: watch::Receiver<PodDescriptor>,
    metrics: watch::Sender<Value>,
}

impl Lifecycle {
    pub fn new(
        hook: Arc<dyn Piped>,
        autostart: bool,
        registry: mpsc::Sender<RegistryCmd>,
        agent_events: mpsc::Sender<AgentEvent>,
        info: watch::Receiver<PodDescriptor>,
        metrics: watch::Sender<Value>,
    ) -> Self {
        let supervisor = Supervisor::new(hook.checks(), hook.check_every());
        Self {
            hook,
            state: PodState::Idle,
            enabled: autostart,
            initialized: false,
            supervisor,
            backoff: RetryConfig {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: false,
            },
            last_view: None,
            last_command: None,
            registry,
            agent_events,
            info,
            metrics,
        }
    }

    /// Actor loop: strictly serialized control requests plus child events.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ControlRequest>) {
        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    let response = self.handle(request.verb, request.body).await;
                    let _ = request.reply.send(response);
                }
                event = self.supervisor.event() => match event {
                    SupervisorEvent::Exited(code) => self.on_child_exit(code).await,
                    SupervisorEvent::SanityDue => self.on_sanity_due().await,
                },
            }
        }
    }

    async fn handle(&mut self, verb: ControlVerb, body: Option<Value>) -> ControlResponse {
        debug!(verb = ?verb, state = %self.state, "control request");
        if self.state == PodState::Dead {
            // An explicitly killed pod idles forever; 410 tells the leader
            // to skip it.
            return ControlResponse::new(410, json!({}));
        }

        match verb {
            ControlVerb::Check => self.handle_check(parse_view(body)).await,
            ControlVerb::On => self.handle_on(parse_view(body)).await,
            ControlVerb::Off => self.handle_off().await,
            ControlVerb::Kill => self.handle_kill().await,
            ControlVerb::Signal => self.handle_signal(body.unwrap_or(Value::Null)).await,
        }
    }

    async fn handle_check(&mut self, view: Option<ClusterView>) -> ControlResponse {
        let Some(view) = view else {
            return ControlResponse::new(200, json!({"ok": true}));
        };

        let resume = self.state;
        self.set_state(PodState::Checking);
        let verdict = self
            .blocking(QUICK_HOOK_DEADLINE, move |hook| hook.can_configure(&view))
            .await;
        self.set_state(resume);

        match verdict {
            Ok(()) => ControlResponse::new(200, json!({"ok": true})),
            Err(err) => {
                warn!(error = %err, "pre-check rejected");
                ControlResponse::new(406, json!({}))
            }
        }
    }

    async fn handle_on(&mut self, view: Option<ClusterView>) -> ControlResponse {
        if view.is_none() {
            // A bare /control/on comes from an operator and arms the pod
            // even when it registered with start disabled.
            self.enabled = true;
        } else if !self.enabled {
            debug!("pod not armed, ignoring leader request");
            return ControlResponse::new(200, json!({"state": "stopped"}));
        }

        if !self.initialized {
            let deadline = self.hook.damper() * 10;
            if let Err(err) = self.blocking(deadline, |hook| hook.initialize()).await {
                warn!(error = %err, "initialize failed");
                return self.fail().await;
            }
            self.initialized = true;
        }

        let view = view.or_else(|| self.last_view.clone());

        if self.supervisor.active() {
            let reconfigure = self.hook.strict()
                || match (&view, &self.last_view) {
                    (Some(new), Some(last)) => new.dependencies != last.dependencies,
                    _ => true,
                };
            if !reconfigure {
                debug!("child healthy and dependencies unchanged, skipping");
                return ControlResponse::new(200, json!({"state": "running"}));
            }
            self.set_state(PodState::Stopping);
            let grace = self.hook.grace();
            self.supervisor.stop(self.hook.as_ref(), grace).await;
        }

        let spec = match view {
            Some(view) => {
                self.set_state(PodState::Configuring);
                let deadline = self.hook.damper() * 10;
                let to_configure = view.clone();
                match self
                    .blocking(deadline, move |hook| hook.configure(&to_configure))
                    .await
                {
                    Ok(spec) => {
                        info!(
                            index = view.index().unwrap_or_default(),
                            size = view.size(),
                            "pod configured"
                        );
                        self.last_view = Some(view);
                        self.last_command = Some(spec.clone());
                        spec
                    }
                    Err(err) => {
                        warn!(error = %err, "configure failed");
                        return self.fail().await;
                    }
                }
            }
            None => match self.last_command.clone() {
                // Armed without a topology: rerun the previous command.
                Some(spec) => spec,
                None => {
                    warn!("start requested before any configuration");
                    return ControlResponse::new(406, json!({}));
                }
            },
        };

        match self.spawn(&spec).await {
            Ok(_) => {
                // A fresh configuration opens a fresh restart budget; crash
                // respawns must not.
                self.supervisor.reset_budget();
                ControlResponse::new(200, json!({"state": "running"}))
            }
            Err(err) => {
                warn!(error = %err, "spawn failed");
                self.fail().await
            }
        }
    }

    async fn handle_off(&mut self) -> ControlResponse {
        let had_child = self.supervisor.active();
        if had_child {
            self.set_state(PodState::Stopping);
            let grace = self.hook.grace();
            self.supervisor.stop(self.hook.as_ref(), grace).await;
        }
        self.set_state(PodState::Idle);
        self.set_process(ProcessState::Stopped).await;

        if had_child && self.hook.full_shutdown() {
            info!("full shutdown requested, notifying agent");
            let _ = self.agent_events.send(AgentEvent::FullShutdown).await;
        }
        ControlResponse::new(200, json!({"state": "stopped"}))
    }

    async fn handle_kill(&mut self) -> ControlResponse {
        if self.supervisor.active() {
            self.set_state(PodState::Stopping);
            let grace = self.hook.grace();
            self.supervisor.stop(self.hook.as_ref(), grace).await;
        }

        info!("finalizing pod");
        let _ = self
            .blocking(self.hook.grace(), |hook| {
                hook.finalize();
                Ok(())
            })
            .await
            .map_err(|err| warn!(error = %err, "finalize failed"));

        self.set_state(PodState::Dead);
        self.set_process(ProcessState::Dead).await;
        ControlResponse::new(200, json!({"state": "dead"}))
    }

    async fn handle_signal(&mut self, body: Value) -> ControlResponse {
        match self
            .blocking(QUICK_HOOK_DEADLINE, move |hook| hook.signaled(body))
            .await
        {
            Ok(out) => ControlResponse::new(200, out),
            Err(err) => {
                warn!(error = %err, "signal hook failed");
                ControlResponse::new(500, json!({}))
            }
        }
    }

    async fn on_child_exit(&mut self, code: Option<i32>) {
        let voluntary = code == Some(0);
        if voluntary && !self.hook.strict() {
            // A clean exit means the pod's job is done; idle until the
            // container goes away.
            info!("child exited cleanly, pod going dead");
            self.hook.finalize();
            self.set_state(PodState::Dead);
            self.set_process(ProcessState::Dead).await;
            return;
        }
        warn!(code, "child died");
        self.restart_or_fail().await;
    }

    async fn on_sanity_due(&mut self) {
        let Some(pid) = self.supervisor.pid() else {
            return;
        };
        match self
            .blocking(QUICK_HOOK_DEADLINE, move |hook| hook.sanity_check(pid))
            .await
        {
            Ok(report) => {
                self.supervisor.reset_budget();
                if let Some(metrics) = report {
                    let _ = self.metrics.send(metrics);
                }
            }
            Err(err) => {
                warn!(pid, error = %err, "sanity check failed");
                self.set_state(PodState::Stopping);
                let grace = self.hook.grace();
                self.supervisor.stop(self.hook.as_ref(), grace).await;
                self.restart_or_fail().await;
            }
        }
    }

    /// Shared crash path: burn one restart and relaunch the last command,
    /// or give up into `Failed` once the budget is gone.
    async fn restart_or_fail(&mut self) {
        if !self.supervisor.consume_budget() {
            warn!("restart budget exhausted");
            self.set_state(PodState::Failed);
            self.set_process(ProcessState::Failed).await;
            return;
        }

        let attempt = self.supervisor.restarts();
        let delay = self.backoff.delay_for_attempt(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "restarting child");
        tokio::time::sleep(delay).await;

        match self.last_command.clone() {
            Some(spec) => {
                if let Err(err) = self.spawn(&spec).await {
                    warn!(error = %err, "restart failed");
                    self.set_state(PodState::Failed);
                    self.set_process(ProcessState::Failed).await;
                }
            }
            None => {
                self.set_state(PodState::Failed);
                self.set_process(ProcessState::Failed).await;
            }
        }
    }

    async fn spawn(&mut self, spec: &CommandSpec) -> Result<u32> {
        // The child sees its own registration payload, like every other
        // environment variable the orchestrator handed us.
        let mut extra = HashMap::new();
        if let Ok(payload) = serde_json::to_string(&*self.info.borrow()) {
            extra.insert("ochopod".to_string(), payload);
        }

        let cwd = self.hook.cwd();
        let pid = self
            .supervisor
            .start(spec, cwd.as_deref(), self.hook.shell(), &extra)?;
        self.set_state(PodState::Running);
        self.set_process(ProcessState::Running).await;
        Ok(pid)
    }

    async fn fail(&mut self) -> ControlResponse {
        self.set_state(PodState::Failed);
        self.set_process(ProcessState::Failed).await;
        ControlResponse::new(406, json!({}))
    }

    fn set_state(&mut self, state: PodState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "transition");
            self.state = state;
        }
    }

    async fn set_process(&mut self, process: ProcessState) {
        let _ = self.registry.send(RegistryCmd::Process(process)).await;
    }

    /// Run a hook callback off the actor thread with a deadline. The actor
    /// still awaits the outcome, so requests stay serialized.
    async fn blocking<T, F>(&self, deadline: Duration, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn Piped>) -> Result<T> + Send + 'static,
    {
        let hook = Arc::clone(&self.hook);
        match tokio::time::timeout(deadline, tokio::task::spawn_blocking(move || f(hook))).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(AgentError::HookCrash(join.to_string())),
            Err(_) => Err(AgentError::Timeout("hook deadline exceeded".into())),
        }
    }
}

fn parse_view(body: Option<Value>) -> Option<ClusterView> {
    body.and_then(|value| serde_json::from_value(value).ok())
}

/// Build the control channel pair for the HTTP server and the actor.
pub fn control_channel() -> (mpsc::Sender<ControlRequest>, mpsc::Receiver<ControlRequest>) {
    mpsc::channel(32)
}
