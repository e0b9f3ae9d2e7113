//! # Per-Peer Identify Push Handler
//!
//! One [`PeerHandler`] exists per connected remote peer. It remembers the
//! snapshot last sent to that peer and runs a background loop that pushes the
//! current snapshot whenever the coalescing push signal fires.
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped --start--> Running --stop--> Stopped
//!                       |
//!                       +-- parent lifetime cancelled --> Terminated
//! ```
//!
//! - `start` on a running handler is a bug in the owner and panics.
//! - `stop` is idempotent.
//! - The `on_exit` hook passed to `start` runs exactly once when the loop ends,
//!   however it ends.
//!
//! ## Push path
//!
//! 1. Wait for the identify-completion latch of every live connection to the peer.
//! 2. Consult the peerstore; skip peers known not to speak the push protocol.
//! 3. Take a permit from the process-wide admission semaphore.
//! 4. Negotiate a stream without dialing, bounded by the negotiation timeout.
//! 5. Record the current snapshot as last sent and write it, chunked.
//!
//! Every wait on that path is cancelled by the handler's lifetime. Pushes from
//! one handler are strictly serialized by the loop.

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::identity::Identity;
use crate::protocols::{IDENTIFY_PUSH_PROTOCOL, IdentifyHost, PushStream, StreamOptions};
use crate::service::IdentifyShared;
use crate::signal::PushSignal;
use crate::snapshot::IdentifySnapshot;

/// Failure modes of opening a push stream.
#[derive(Debug)]
pub enum OpenStreamError {
    /// The peerstore says the peer speaks none of the requested protocols.
    ProtocolNotSupported,
    /// The handler's lifetime ended while waiting.
    Cancelled,
    /// Negotiation did not finish within the configured bound.
    Timeout(Duration),
    /// The host failed to negotiate the stream.
    Negotiation(anyhow::Error),
}

impl std::fmt::Display for OpenStreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProtocolNotSupported => write!(f, "protocol not supported"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Timeout(after) => write!(f, "stream negotiation timed out after {after:?}"),
            Self::Negotiation(_) => write!(f, "stream negotiation failed"),
        }
    }
}

impl std::error::Error for OpenStreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Negotiation(e) => Some(&**e),
            _ => None,
        }
    }
}

/// True if `err` (or anything it wraps) is a cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<OpenStreamError>(), Some(OpenStreamError::Cancelled)))
}

/// Runs `on_exit` when dropped, so the hook fires on every way out of the loop.
struct ExitGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for ExitGuard<F> {
    fn drop(&mut self) {
        if let Some(on_exit) = self.0.take() {
            on_exit();
        }
    }
}

pub(crate) struct PeerHandler<H: IdentifyHost> {
    task: Arc<HandlerTask<H>>,
    signal: PushSignal,
    cancel: Option<CancellationToken>,
}

impl<H: IdentifyHost> PeerHandler<H> {
    /// Create a stopped handler pre-populated with the current snapshot.
    pub(crate) fn new(peer: Identity, shared: Arc<IdentifyShared<H>>) -> Self {
        let (signal, push_rx) = PushSignal::channel();
        let snapshot = shared.snapshot();
        Self {
            task: Arc::new(HandlerTask {
                peer,
                shared,
                snapshot: StdRwLock::new(snapshot),
                push_rx: Mutex::new(push_rx),
            }),
            signal,
            cancel: None,
        }
    }

    /// Launch the push loop under a child of `parent`.
    ///
    /// Must not be called on a running handler, nor after `parent` has been
    /// cancelled.
    pub(crate) fn start<F>(&mut self, parent: &CancellationToken, on_exit: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.cancel.is_some() {
            panic!("peer handler already running");
        }
        if parent.is_cancelled() {
            panic!("peer handler started under a cancelled lifetime");
        }

        let token = parent.child_token();
        self.cancel = Some(token.clone());
        tokio::spawn(self.task.clone().run(token, on_exit));
    }

    /// Cancel the push loop. Safe to call on a stopped handler.
    pub(crate) fn stop(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        Ok(())
    }

    /// Request a push. Coalesces with any push already pending.
    pub(crate) fn trigger_push(&self) {
        if !self.signal.trigger() {
            trace!(peer = %self.task.peer.short(), "identify push already pending");
        }
    }

    pub(crate) fn last_sent(&self) -> Arc<IdentifySnapshot> {
        self.task.last_sent()
    }
}

impl<H: IdentifyHost> Drop for PeerHandler<H> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct HandlerTask<H: IdentifyHost> {
    peer: Identity,
    shared: Arc<IdentifyShared<H>>,
    snapshot: StdRwLock<Arc<IdentifySnapshot>>,
    /// Held by the running loop; a restarted loop waits for the old one to let go.
    push_rx: Mutex<mpsc::Receiver<()>>,
}

impl<H: IdentifyHost> HandlerTask<H> {
    fn last_sent(&self) -> Arc<IdentifySnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_last_sent(&self, snapshot: Arc<IdentifySnapshot>) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    async fn run<F: FnOnce()>(self: Arc<Self>, token: CancellationToken, on_exit: F) {
        let _exit = ExitGuard(Some(on_exit));

        let mut push_rx = tokio::select! {
            rx = self.push_rx.lock() => rx,
            _ = token.cancelled() => return,
        };
        debug!(peer = %self.peer.short(), "identify push loop started");

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!(peer = %self.peer.short(), "identify push loop stopped");
                    return;
                }
                pushed = push_rx.recv() => {
                    if pushed.is_none() {
                        return;
                    }
                    if let Err(e) = self.send_push(&token).await {
                        if is_cancellation(&e) {
                            trace!(peer = %self.peer.short(), "identify push cancelled");
                        } else {
                            warn!(peer = %self.peer.short(), "failed to send identify push: {:#}", e);
                        }
                    }
                }
            }
        }
    }

    async fn send_push(&self, token: &CancellationToken) -> Result<()> {
        let protocols = [IDENTIFY_PUSH_PROTOCOL.to_string()];
        let mut stream = match self.open_stream(token, &protocols).await {
            Ok(stream) => stream,
            Err(OpenStreamError::ProtocolNotSupported) => {
                debug!(peer = %self.peer.short(), "not sending push as peer does not support protocol");
                return Ok(());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("failed to open push stream")),
        };

        let snapshot = self.shared.snapshot();
        self.set_last_sent(snapshot.clone());

        let written = tokio::select! {
            result = self.shared.write_chunked_identify_msg(&snapshot, &mut stream) => result,
            _ = token.cancelled() => Err(anyhow::Error::new(OpenStreamError::Cancelled)),
        };
        if let Err(e) = written {
            stream.reset().await;
            return Err(e.context("failed to send push message"));
        }

        if let Err(e) = stream.close().await {
            debug!(peer = %self.peer.short(), error = %e, "failed to close push stream");
        }
        debug!(
            peer = %self.peer.short(),
            conn = %stream.connection(),
            protocol = stream.protocol(),
            seq = snapshot.seq,
            digest = %hex::encode(&snapshot.digest()[..8]),
            "sent identify push"
        );
        Ok(())
    }

    async fn open_stream(
        &self,
        token: &CancellationToken,
        protocols: &[String],
    ) -> Result<H::Stream, OpenStreamError> {
        // Learn what the peer speaks before negotiating with it.
        self.wait_identified(token).await?;

        if !self.peer_supports_protos(token, protocols).await {
            if token.is_cancelled() {
                return Err(OpenStreamError::Cancelled);
            }
            return Err(OpenStreamError::ProtocolNotSupported);
        }

        let _permit = tokio::select! {
            permit = self.shared.push_semaphore.acquire() => {
                permit.map_err(|_| OpenStreamError::Negotiation(anyhow!("push semaphore closed")))?
            }
            _ = token.cancelled() => return Err(OpenStreamError::Cancelled),
        };

        let timeout = self.shared.config.negotiation_timeout;
        let negotiation = self.shared.host.new_stream(
            &self.peer,
            protocols,
            StreamOptions::no_dial("should already have connection"),
        );
        tokio::select! {
            result = tokio::time::timeout(timeout, negotiation) => match result {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(OpenStreamError::Negotiation(e)),
                Err(_) => Err(OpenStreamError::Timeout(timeout)),
            },
            _ = token.cancelled() => Err(OpenStreamError::Cancelled),
        }
    }

    /// Wait for the identify-completion latch of every live connection to the peer.
    async fn wait_identified(&self, token: &CancellationToken) -> Result<(), OpenStreamError> {
        for conn in self.shared.host.conns_to_peer(&self.peer) {
            let latch = self.shared.identify_wait(conn);
            tokio::select! {
                _ = latch.wait() => {}
                _ = token.cancelled() => return Err(OpenStreamError::Cancelled),
            }
        }
        Ok(())
    }

    /// True if the peer supports at least one of `protocols`.
    ///
    /// A failed peerstore lookup counts as supported.
    async fn peer_supports_protos(&self, token: &CancellationToken, protocols: &[String]) -> bool {
        if self.wait_identified(token).await.is_err() {
            return false;
        }

        match self.shared.host.supports_protocols(&self.peer, protocols) {
            Ok(supported) => !supported.is_empty(),
            Err(e) => {
                debug!(peer = %self.peer.short(), error = %e, "protocol lookup failed, assuming supported");
                true
            }
        }
    }
}
