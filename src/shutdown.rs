//! Application shutdown.
//!
//! `ShutdownCoordinator` waits for the first shutdown request (Ctrl-C,
//! SIGTERM or an explicit `quit`) and then stops every live command, returning
//! only once all of them have exited.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::runner::CommandRunner;

/// What asked the application to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "SIGINT"),
            ShutdownReason::Terminate => write!(f, "SIGTERM"),
            ShutdownReason::Requested => write!(f, "quit requested"),
        }
    }
}

/// Cloneable handle that requests shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: mpsc::Sender<ShutdownReason>,
}

impl ShutdownTrigger {
    pub fn request(&self, reason: ShutdownReason) {
        // A full queue already holds a pending request.
        let _ = self.tx.try_send(reason);
    }
}

pub struct ShutdownCoordinator {
    runner: CommandRunner,
    grace: Option<Duration>,
    tx: mpsc::Sender<ShutdownReason>,
    rx: mpsc::Receiver<ShutdownReason>,
}

impl ShutdownCoordinator {
    /// `grace` bounds how long each command may take to exit after being
    /// asked to stop before it is killed. `None` waits indefinitely.
    pub fn new(runner: CommandRunner, grace: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::channel(4);
        Self {
            runner,
            grace,
            tx,
            rx,
        }
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: self.tx.clone(),
        }
    }

    /// Routes Ctrl-C and SIGTERM into this coordinator.
    pub fn listen_for_signals(&self) {
        spawn_signal_listener(self.trigger());
    }

    /// Waits for the first shutdown request.
    pub async fn wait(&mut self) -> ShutdownReason {
        // `self.tx` keeps the channel open, so `recv` only yields requests.
        self.rx.recv().await.unwrap_or(ShutdownReason::Requested)
    }

    /// Stops every live command and waits for all of them to exit. Returns
    /// the number of commands that were stopped.
    pub async fn shutdown(&self, reason: ShutdownReason) -> usize {
        info!(%reason, running = ?self.runner.running_ids(), "shutting down");
        let stopped = match self.grace {
            Some(grace) => self.runner.terminate_all_with_timeout(grace).await,
            None => self.runner.terminate_all().await,
        };
        if self.runner.is_any_running() {
            warn!("commands still registered after shutdown");
        }
        info!(stopped, "shutdown complete");
        stopped
    }
}

fn spawn_signal_listener(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "failed to listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    trigger.request(ShutdownReason::Interrupt);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => trigger.request(ShutdownReason::Interrupt),
                _ = sigterm.recv() => trigger.request(ShutdownReason::Terminate),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            trigger.request(ShutdownReason::Interrupt);
        }
    });
}
