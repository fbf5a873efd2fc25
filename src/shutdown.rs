//! Cooperative cancellation shared by paginators and background monitors.
//!
//! Loops check [`ShutdownCoordinator::is_shutdown_requested`] at the top of
//! each iteration and sleep through [`ShutdownCoordinator::sleep`], so a
//! request lands after the current page or tick finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

pub type SharedShutdown = Arc<ShutdownCoordinator>;

#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Idempotent. Wakes every current waiter.
    pub fn request_shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// A coordinator that is also requested when `self` is, but can be
    /// stopped on its own. Must be called inside a tokio runtime.
    pub fn child(self: &Arc<Self>) -> SharedShutdown {
        let child = Self::shared();
        if self.is_shutdown_requested() {
            child.request_shutdown();
            return child;
        }
        let parent = Arc::clone(self);
        let weak = Arc::downgrade(&child);
        tokio::spawn(async move {
            parent.wait_for_shutdown().await;
            if let Some(child) = weak.upgrade() {
                child.request_shutdown();
            }
        });
        child
    }

    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent request cannot slip between.
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Sleeps for `period` unless shutdown is requested first.
    /// Returns `true` when the full period elapsed.
    pub async fn sleep(&self, period: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(period) => !self.is_shutdown_requested(),
            _ = self.wait_for_shutdown() => false,
        }
    }
}

/// Requests shutdown on Ctrl-C. Runs until the signal arrives.
pub async fn shutdown_on_ctrl_c(shutdown: SharedShutdown) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupt received, finishing current step before stopping");
        shutdown.request_shutdown();
    }
}
