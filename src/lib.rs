//! # identify-push - Proactive Identify Updates for Connected Peers
//!
//! When the local node's advertised identity changes (new listen addresses,
//! new protocols, a fresh signed address record), every connected peer should
//! learn about it without waiting for the next full identify exchange. This
//! crate is the per-peer machinery that does so.
//!
//! ## Architecture
//!
//! - One [`IdentifyService`] per node owns the current snapshot, the
//!   admission semaphore and one identify-completion latch per connection.
//! - One peer handler per connected peer runs a background loop that waits
//!   on a coalescing push signal and pushes the latest snapshot.
//! - All network access goes through the [`IdentifyHost`] trait.
//!
//! ## Guarantees
//!
//! - A burst of identity changes collapses into at most one queued push per peer
//! - No push is negotiated before the peer's own identify response is recorded
//! - Peers known not to support the push protocol are never negotiated with
//! - Concurrent push negotiations across all peers are bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `service` | Identify service: snapshot, semaphore, latches, handler registry |
//! | `peer_handler` | Per-peer push loop, stream negotiation, protocol gating |
//! | `signal` | Identify-completion latch and coalescing push signal |
//! | `snapshot` | Immutable identity snapshots and their publisher |
//! | `messages` | Identify wire message, framing and chunked writer |
//! | `protocols` | Host seam traits and protocol ids |
//! | `identity` | Keypairs, Identities, signed address records |
//! | `crypto` | Domain-separated Ed25519 signatures |
//! | `config` | Tunables |

mod config;
mod crypto;
mod identity;
mod messages;
mod peer_handler;
mod protocols;
mod service;
mod signal;
mod snapshot;

#[cfg(test)]
mod test_support;

pub use config::IdentifyConfig;
pub use crypto::SignatureError;
pub use identity::{Identity, Keypair, SignedAddressRecord};
pub use messages::{IdentifyMessage, decode_identify_frames, encode_frame};
pub use peer_handler::{OpenStreamError, is_cancellation};
pub use protocols::{
    ConnectionId, IDENTIFY_PUSH_PROTOCOL, IdentifyHost, PushStream, StreamOptions,
};
pub use service::IdentifyService;
pub use signal::IdentifyLatch;
pub use snapshot::{IdentifySnapshot, SnapshotPublisher};
