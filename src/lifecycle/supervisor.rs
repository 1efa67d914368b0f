//! Child process supervision.
//!
//! Owned by the lifecycle actor while the pod is running. The supervisor
//! spawns the command returned by `configure`, reports exits and periodic
//! sanity-check ticks, enforces the graceful teardown sequence (hook
//! tear-down, grace period, SIGKILL) and tracks the restart budget.

use crate::error::{AgentError, Result};
use crate::lifecycle::Piped;
use crate::types::CommandSpec;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Events surfaced to the lifecycle actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The child exited; `None` means it was killed by a signal.
    Exited(Option<i32>),
    /// Time to run the hook's sanity check.
    SanityDue,
}

/// Subprocess supervisor state.
pub struct Supervisor {
    child: Option<Child>,
    pid: Option<u32>,
    checks: u32,
    budget: u32,
    check_every: Duration,
    next_check: Instant,
}

impl Supervisor {
    pub fn new(checks: u32, check_every: Duration) -> Self {
        Self {
            child: None,
            pid: None,
            checks,
            budget: checks,
            check_every,
            next_check: Instant::now() + check_every,
        }
    }

    /// Whether a child is currently owned.
    pub fn active(&self) -> bool {
        self.child.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the configured command. At most one child may exist at a time.
    pub fn start(
        &mut self,
        spec: &CommandSpec,
        cwd: Option<&Path>,
        shell: bool,
        extra_env: &HashMap<String, String>,
    ) -> Result<u32> {
        if self.child.is_some() {
            return Err(AgentError::Subprocess("child already running".into()));
        }

        let mut command = if shell {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(&spec.command);
            command
        } else {
            let mut tokens = spec.command.split_whitespace();
            let program = tokens
                .next()
                .ok_or_else(|| AgentError::Subprocess("empty command line".into()))?;
            let mut command = Command::new(program);
            command.args(tokens);
            command
        };

        command.kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        for (key, value) in extra_env.iter().chain(spec.env.iter()) {
            command.env(key, value);
        }

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| AgentError::Subprocess("child exited before spawn returned".into()))?;

        info!(pid, command = spec.command.as_str(), "started child");
        self.child = Some(child);
        self.pid = Some(pid);
        self.next_check = Instant::now() + self.check_every;
        Ok(pid)
    }

    /// Next supervision event; pends forever without a child so it can sit
    /// in the lifecycle actor's select loop unconditionally.
    pub async fn event(&mut self) -> SupervisorEvent {
        let next_check = self.next_check;
        let exited = match self.child.as_mut() {
            Some(child) => tokio::select! {
                status = child.wait() => Some(status),
                _ = tokio::time::sleep_until(next_check) => None,
            },
            None => std::future::pending().await,
        };

        match exited {
            Some(status) => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(err) => {
                        warn!(error = %err, "wait failed");
                        Some(-1)
                    }
                };
                debug!(pid = self.pid, code, "child exited");
                self.child = None;
                self.pid = None;
                SupervisorEvent::Exited(code)
            }
            None => {
                self.next_check = Instant::now() + self.check_every;
                SupervisorEvent::SanityDue
            }
        }
    }

    /// Graceful teardown: hook tear-down (SIGTERM by default), wait up to
    /// `grace`, then SIGKILL.
    pub async fn stop(&mut self, hook: &dyn Piped, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = self.pid.take().unwrap_or_default();

        info!(pid, "tearing down child");
        if let Err(err) = hook.tear_down(pid) {
            warn!(pid, error = %err, "tear-down hook failed, relying on grace escalation");
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(pid, code = status.code(), "child terminated"),
            Ok(Err(err)) => warn!(pid, error = %err, "wait failed during teardown"),
            Err(_) => {
                warn!(pid, grace_secs = grace.as_secs(), "grace expired, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }

    /// Consume one restart; true while budget remains.
    pub fn consume_budget(&mut self) -> bool {
        if self.budget == 0 {
            return false;
        }
        self.budget -= 1;
        true
    }

    /// Restarts already consumed since the last reset.
    pub fn restarts(&self) -> u32 {
        self.checks - self.budget
    }

    /// A healthy sanity check restores the full budget.
    pub fn reset_budget(&mut self) {
        self.budget = self.checks;
    }
}
