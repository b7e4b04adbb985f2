//! Server State - registry of authenticated clients and lifecycle
//!
//! Holds the only cross-session mutable state: the authenticated client
//! count and the shutdown flag. Shared as `Arc<Registry>` by the listener
//! and every session task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Listening,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No authenticated clients for the whole idle timeout
    IdleTimeout,
    /// A client sent `Shutdown` and shutdown requests are allowed
    Requested,
    /// Interrupted locally (Ctrl-C)
    Interrupted,
}

pub struct Registry {
    clients: watch::Sender<usize>,
    shutdown_requested: AtomicBool,
    reason: OnceLock<ShutdownReason>,
    lifecycle: watch::Sender<LifecycleState>,
    cancel: CancellationToken,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: watch::Sender::new(0),
            shutdown_requested: AtomicBool::new(false),
            reason: OnceLock::new(),
            lifecycle: watch::Sender::new(LifecycleState::Listening),
            cancel: CancellationToken::new(),
        })
    }

    /// Count a newly authenticated session. Dropping the guard uncounts it.
    pub fn client_authenticated(self: &Arc<Self>) -> ClientGuard {
        self.clients.send_modify(|count| *count += 1);
        ClientGuard {
            registry: Arc::clone(self),
        }
    }

    pub fn authenticated_clients(&self) -> usize {
        *self.clients.borrow()
    }

    /// Handle a remote `Shutdown`. Returns false if one was already accepted.
    pub fn request_shutdown(&self) -> bool {
        if self
            .shutdown_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.begin_drain(ShutdownReason::Requested);
        true
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Move to `Draining` and cancel every task. The first reason wins.
    pub fn begin_drain(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        info!("Draining: {:?}", reason);
        self.lifecycle.send_replace(LifecycleState::Draining);
        self.cancel.cancel();
        true
    }

    pub fn mark_stopped(&self) {
        self.lifecycle.send_replace(LifecycleState::Stopped);
        info!("Stopped");
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Idle shutdown policy.
    ///
    /// The timer is armed whenever the client count is zero (including at
    /// startup) and disarmed by any authentication. If it runs out, the
    /// server drains with [`ShutdownReason::IdleTimeout`].
    pub async fn run_idle_monitor(self: Arc<Self>, timeout: Duration) {
        let mut clients = self.clients.subscribe();
        loop {
            let idle = *clients.borrow_and_update() == 0;
            if idle {
                debug!("No authenticated clients, idle timer armed for {:?}", timeout);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(timeout), if idle => {
                    info!("Idle for {:?}, shutting down", timeout);
                    self.begin_drain(ShutdownReason::IdleTimeout);
                    return;
                }
                changed = clients.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Keeps one session counted as authenticated
pub struct ClientGuard {
    registry: Arc<Registry>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.registry
            .clients
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}
