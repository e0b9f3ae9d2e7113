//! # Identify Service
//!
//! Process-wide owner of everything peer handlers share:
//!
//! - the current [`IdentifySnapshot`] (published, never mutated)
//! - the admission semaphore bounding concurrent push negotiations
//! - one [`IdentifyLatch`] per live connection
//! - the registry of running [`PeerHandler`]s, one per connected peer
//!
//! ## Lifecycle
//!
//! ```ignore
//! let service = IdentifyService::new(host, keypair, IdentifyConfig::default())?;
//! service.update_local_identity(protocols, addrs);
//!
//! // connection events from the node
//! service.peer_connected(peer, conn);
//! service.identify_complete(conn);
//! service.connection_closed(peer, conn);
//!
//! service.close().await;
//! ```
//!
//! Every call to [`IdentifyService::update_local_identity`] publishes a new
//! snapshot and nudges every peer handler; each handler then pushes on its
//! own task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::config::IdentifyConfig;
use crate::identity::{Identity, Keypair};
use crate::messages::{self, IdentifyMessage};
use crate::peer_handler::PeerHandler;
use crate::protocols::{ConnectionId, IdentifyHost, PushStream};
use crate::signal::IdentifyLatch;
use crate::snapshot::{IdentifySnapshot, SnapshotPublisher};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// State shared with peer handlers
// ============================================================================

pub(crate) struct IdentifyShared<H: IdentifyHost> {
    pub(crate) host: Arc<H>,
    pub(crate) config: IdentifyConfig,
    keypair: Keypair,
    snapshots: SnapshotPublisher,
    /// Admission semaphore for push stream negotiation across all peers.
    pub(crate) push_semaphore: Semaphore,
    identify_waits: StdMutex<HashMap<ConnectionId, IdentifyLatch>>,
}

impl<H: IdentifyHost> IdentifyShared<H> {
    pub(crate) fn new(host: Arc<H>, keypair: Keypair, config: IdentifyConfig) -> Self {
        Self {
            host,
            push_semaphore: Semaphore::new(config.max_concurrent_pushes),
            config,
            keypair,
            snapshots: SnapshotPublisher::new(IdentifySnapshot::default()),
            identify_waits: StdMutex::new(HashMap::new()),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<IdentifySnapshot> {
        self.snapshots.current()
    }

    pub(crate) fn publish(&self, protocols: Vec<String>, addrs: Vec<String>) -> Arc<IdentifySnapshot> {
        let record = if self.config.disable_signed_records {
            None
        } else {
            Some(self.keypair.sign_address_record(addrs.clone()))
        };
        self.snapshots.publish(protocols, addrs, record)
    }

    /// Start tracking identify completion for `conn`. Idempotent.
    pub(crate) fn register_connection(&self, conn: ConnectionId) {
        lock(&self.identify_waits).entry(conn).or_default();
    }

    /// The completion latch for `conn`.
    ///
    /// A connection that is not registered (never seen, or already closed)
    /// has nothing left to wait for, so it gets a latch that has already fired.
    pub(crate) fn identify_wait(&self, conn: ConnectionId) -> IdentifyLatch {
        match lock(&self.identify_waits).get(&conn) {
            Some(latch) => latch.clone(),
            None => IdentifyLatch::fired(),
        }
    }

    /// Fire the latch of a registered connection. Returns `false` if it had
    /// already fired or the connection is unknown.
    pub(crate) fn identify_complete(&self, conn: ConnectionId) -> bool {
        let latch = lock(&self.identify_waits).get(&conn).cloned();
        match latch {
            Some(latch) => latch.fire(),
            None => {
                trace!(%conn, "identify completed on unregistered connection");
                false
            }
        }
    }

    /// Drop the latch of a closed connection, releasing anyone still waiting on it.
    pub(crate) fn forget_connection(&self, conn: ConnectionId) {
        let latch = lock(&self.identify_waits).remove(&conn);
        if let Some(latch) = latch {
            latch.fire();
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_connections(&self) -> usize {
        lock(&self.identify_waits).len()
    }

    /// Serialize `snapshot` and write it to `stream`, chunking if needed.
    pub(crate) async fn write_chunked_identify_msg<S>(&self, snapshot: &IdentifySnapshot, stream: &mut S) -> Result<()>
    where
        S: PushStream + ?Sized,
    {
        let message = IdentifyMessage::from_snapshot(
            snapshot,
            &self.config,
            self.keypair.identity(),
            stream.remote_addr(),
        );
        messages::write_chunked(stream, message, self.config.legacy_message_size).await
    }
}

// ============================================================================
// Public service
// ============================================================================

pub struct IdentifyService<H: IdentifyHost> {
    shared: Arc<IdentifyShared<H>>,
    handlers: StdMutex<HashMap<Identity, PeerHandler<H>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<H: IdentifyHost> IdentifyService<H> {
    pub fn new(host: Arc<H>, keypair: Keypair, config: IdentifyConfig) -> Result<Self> {
        config.validate().context("invalid identify configuration")?;
        Ok(Self {
            shared: Arc::new(IdentifyShared::new(host, keypair, config)),
            handlers: StdMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_identity(&self) -> Identity {
        self.shared.keypair.identity()
    }

    pub fn config(&self) -> &IdentifyConfig {
        &self.shared.config
    }

    /// The current local snapshot.
    pub fn snapshot(&self) -> Arc<IdentifySnapshot> {
        self.shared.snapshot()
    }

    /// Publish a new local identity and ask every connected peer to be pushed.
    pub fn update_local_identity(&self, protocols: Vec<String>, addrs: Vec<String>) -> Arc<IdentifySnapshot> {
        let snapshot = self.shared.publish(protocols, addrs);
        let handlers = lock(&self.handlers);
        for handler in handlers.values() {
            handler.trigger_push();
        }
        debug!(
            seq = snapshot.seq,
            peers = handlers.len(),
            "local identity changed, scheduled identify pushes"
        );
        snapshot
    }

    /// Register a new connection to `peer`, starting a handler if this is
    /// the first connection to it.
    pub fn peer_connected(&self, peer: Identity, conn: ConnectionId) {
        if self.shutdown.is_cancelled() {
            warn!(peer = %peer.short(), %conn, "identify service closed, ignoring connection");
            return;
        }

        self.shared.register_connection(conn);

        let mut handlers = lock(&self.handlers);
        if handlers.contains_key(&peer) {
            trace!(peer = %peer.short(), %conn, "additional connection to known peer");
            return;
        }

        let mut handler = PeerHandler::new(peer, self.shared.clone());
        let token = self.tracker.token();
        handler.start(&self.shutdown, move || drop(token));
        handlers.insert(peer, handler);
        debug!(peer = %peer.short(), %conn, "started identify peer handler");
    }

    /// Mark the remote identify response on `conn` as recorded.
    pub fn identify_complete(&self, conn: ConnectionId) -> bool {
        self.shared.identify_complete(conn)
    }

    /// Forget `conn`; stops the peer's handler once no connection remains.
    pub fn connection_closed(&self, peer: Identity, conn: ConnectionId) {
        self.shared.forget_connection(conn);

        // Checked under the registry lock so a concurrent `peer_connected`
        // either sees the handler gone or keeps it alive.
        let mut handlers = lock(&self.handlers);
        if !self.shared.host.conns_to_peer(&peer).is_empty() {
            return;
        }

        if let Some(mut handler) = handlers.remove(&peer) {
            let _ = handler.stop();
            debug!(peer = %peer.short(), "peer disconnected, stopped identify peer handler");
        }
    }

    /// Ask the handler for `peer` to push the current snapshot.
    pub fn trigger_push(&self, peer: &Identity) -> bool {
        match lock(&self.handlers).get(peer) {
            Some(handler) => {
                handler.trigger_push();
                true
            }
            None => false,
        }
    }

    /// The snapshot most recently pushed (or pre-populated) for `peer`.
    pub fn last_sent(&self, peer: &Identity) -> Option<Arc<IdentifySnapshot>> {
        lock(&self.handlers).get(peer).map(|handler| handler.last_sent())
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Stop every handler and wait until all their loops have exited.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let handlers: Vec<_> = lock(&self.handlers).drain().collect();
        for (_, mut handler) in handlers {
            let _ = handler.stop();
        }

        self.tracker.close();
        self.tracker.wait().await;
        debug!("identify service closed");
    }
}
