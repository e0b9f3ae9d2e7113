//! Host seam for the identify push subsystem.
//!
//! The identify service never talks to sockets itself. Everything it needs
//! from the surrounding node (which connections exist, how to negotiate a
//! stream, what a peer claims to support) goes through [`IdentifyHost`], and
//! every negotiated stream is a [`PushStream`].
//!
//! | Concern | Method |
//! |---------|--------|
//! | Live connections to a peer | [`IdentifyHost::conns_to_peer`] |
//! | Stream negotiation | [`IdentifyHost::new_stream`] |
//! | Peerstore capability lookup | [`IdentifyHost::supports_protocols`] |

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Identity;

/// Protocol id of unsolicited identify pushes.
pub const IDENTIFY_PUSH_PROTOCOL: &str = "/ipfs/id/push/1.0.0";

/// Opaque identifier of one live connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Options applied to a single stream negotiation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// When set, the host must reuse an existing connection and fail instead
    /// of dialing. The string explains why no dial is expected.
    pub no_dial: Option<&'static str>,
}

impl StreamOptions {
    pub fn no_dial(reason: &'static str) -> Self {
        Self { no_dial: Some(reason) }
    }
}

/// A negotiated application stream.
#[async_trait]
pub trait PushStream: Send + 'static {
    /// The protocol id the remote side agreed on.
    fn protocol(&self) -> &str;

    /// The connection the stream is multiplexed over.
    fn connection(&self) -> ConnectionId;

    /// The remote address of the underlying connection, if known.
    fn remote_addr(&self) -> Option<String>;

    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Half-close the stream cleanly after a successful write.
    async fn close(&mut self) -> Result<()>;

    /// Abort the stream, telling the remote side it failed.
    async fn reset(&mut self);
}

/// Node services consulted by the identify subsystem.
#[async_trait]
pub trait IdentifyHost: Send + Sync + 'static {
    type Stream: PushStream;

    /// All currently live connections to `peer`.
    fn conns_to_peer(&self, peer: &Identity) -> Vec<ConnectionId>;

    /// Open a stream to `peer` speaking the first protocol in `protocols`
    /// the remote accepts.
    async fn new_stream(
        &self,
        peer: &Identity,
        protocols: &[String],
        options: StreamOptions,
    ) -> Result<Self::Stream>;

    /// The subset of `protocols` the peerstore records `peer` as supporting.
    fn supports_protocols(&self, peer: &Identity, protocols: &[String]) -> Result<Vec<String>>;
}
