//! Agent termination flag.
//!
//! One watch flag shared by every long-running task. OS signals trip it,
//! and the coordination loop drains the child through the lifecycle before
//! the process exits; there is nothing else to coordinate, so a single
//! boolean watch channel is the whole mechanism.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Cloneable handle on the agent's termination flag.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Trip the flag. Idempotent: only the first call flips it and logs.
    pub fn trip(&self) {
        let flipped = self.tx.send_if_modified(|tripped| {
            if *tripped {
                false
            } else {
                *tripped = true;
                true
            }
        });
        if flipped {
            info!("shutting down");
        }
    }

    pub fn is_tripped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the flag is tripped; immediately when it already is.
    pub async fn tripped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|tripped| *tripped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Trip the flag on the first SIGTERM or SIGINT.
#[cfg(unix)]
pub async fn watch_signals(shutdown: Shutdown) {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    );
    let (Ok(mut sigterm), Ok(mut sigint)) = streams else {
        tracing::error!("failed to install signal handlers");
        return;
    };

    let caught = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = caught, "caught termination signal");
    shutdown.trip();
}
