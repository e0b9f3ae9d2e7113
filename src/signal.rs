//! Signalling primitives shared between the identify service and peer handlers.
//!
//! - [`IdentifyLatch`]: per-connection one-shot readiness latch. It fires once
//!   the remote peer's identify response on that connection has been recorded
//!   and never resets. Any number of tasks may wait on it concurrently.
//! - [`PushSignal`]: single-slot mailbox that coalesces push requests. Extra
//!   triggers while a marker is pending are dropped.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

/// One-shot, broadcast-once readiness latch.
#[derive(Clone, Debug)]
pub struct IdentifyLatch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for IdentifyLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifyLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A latch that has already fired.
    pub fn fired() -> Self {
        let latch = Self::new();
        latch.fire();
        latch
    }

    /// Mark the latch ready. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the latch has fired. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// Coalescing "push requested" signal with capacity exactly one.
pub(crate) struct PushSignal {
    tx: mpsc::Sender<()>,
}

impl PushSignal {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Non-blocking enqueue. Returns `false` when a marker was already pending
    /// (or the receiving loop is gone) and this trigger was folded into it.
    pub(crate) fn trigger(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}
