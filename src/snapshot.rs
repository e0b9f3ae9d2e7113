//! # Identity Snapshots
//!
//! An [`IdentifySnapshot`] captures what the local node currently advertises:
//! its protocols, its listen addresses and (optionally) a signed address
//! record. Snapshots are immutable; every local identity change publishes a
//! brand-new `Arc<IdentifySnapshot>` through the [`SnapshotPublisher`].
//!
//! Readers call [`SnapshotPublisher::current`] and get the latest fully
//! constructed snapshot. A reader holding an older `Arc` keeps seeing that
//! older snapshot; nothing is ever mutated in place.

use std::sync::Arc;

use tokio::sync::watch;

use crate::identity::SignedAddressRecord;

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct IdentifySnapshot {
    /// Monotonic version, incremented on every publish.
    pub seq: u64,
    pub protocols: Vec<String>,
    pub addrs: Vec<String>,
    pub record: Option<SignedAddressRecord>,
}

impl IdentifySnapshot {
    /// BLAKE3 digest over the advertised content (not the sequence number).
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.protocols.len() as u32).to_le_bytes());
        for proto in &self.protocols {
            hasher.update(&(proto.len() as u32).to_le_bytes());
            hasher.update(proto.as_bytes());
        }
        hasher.update(&(self.addrs.len() as u32).to_le_bytes());
        for addr in &self.addrs {
            hasher.update(&(addr.len() as u32).to_le_bytes());
            hasher.update(addr.as_bytes());
        }
        if let Some(record) = &self.record {
            hasher.update(&record.signature);
        }
        *hasher.finalize().as_bytes()
    }
}

/// Publish-new-version holder for the node's current snapshot.
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<IdentifySnapshot>>,
}

impl SnapshotPublisher {
    pub fn new(initial: IdentifySnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<IdentifySnapshot> {
        self.tx.borrow().clone()
    }

    /// Replace the current snapshot with a new one carrying the next sequence number.
    pub fn publish(
        &self,
        protocols: Vec<String>,
        addrs: Vec<String>,
        record: Option<SignedAddressRecord>,
    ) -> Arc<IdentifySnapshot> {
        let mut published = None;
        self.tx.send_modify(|current| {
            let next = Arc::new(IdentifySnapshot {
                seq: current.seq + 1,
                protocols,
                addrs,
                record,
            });
            published = Some(next.clone());
            *current = next;
        });
        published.unwrap_or_else(|| self.current())
    }
}
