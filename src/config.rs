//! Tunables for the identify service and its peer handlers.

use std::time::Duration;

use anyhow::{Result, bail};

/// Default admission semaphore capacity: concurrent push negotiations across all peers.
pub const DEFAULT_MAX_CONCURRENT_PUSHES: usize = 32;

/// Bound on a single push stream negotiation.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages larger than this split the signed record into its own frame.
pub const DEFAULT_LEGACY_MESSAGE_SIZE: usize = 2 * 1024;

/// Maximum size of a single identify frame accepted by a reader.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Maximum number of frames merged into one identify message.
pub const DEFAULT_MAX_MESSAGES: usize = 10;

#[derive(Clone, Debug)]
pub struct IdentifyConfig {
    /// Protocol version string advertised in every identify message.
    pub protocol_version: String,
    /// Agent (implementation) version advertised in every identify message.
    pub agent_version: String,
    /// Capacity of the process-wide admission semaphore.
    pub max_concurrent_pushes: usize,
    /// Upper bound on opening a push stream once a permit is held.
    pub negotiation_timeout: Duration,
    pub legacy_message_size: usize,
    pub max_message_size: usize,
    pub max_messages: usize,
    /// Never attach a signed address record to snapshots.
    pub disable_signed_records: bool,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            protocol_version: "ipfs/0.1.0".to_string(),
            agent_version: concat!("identify-push/", env!("CARGO_PKG_VERSION")).to_string(),
            max_concurrent_pushes: DEFAULT_MAX_CONCURRENT_PUSHES,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            legacy_message_size: DEFAULT_LEGACY_MESSAGE_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_messages: DEFAULT_MAX_MESSAGES,
            disable_signed_records: false,
        }
    }
}

impl IdentifyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_pushes == 0 {
            bail!("max_concurrent_pushes must be at least 1");
        }
        if self.negotiation_timeout.is_zero() {
            bail!("negotiation_timeout must be non-zero");
        }
        if self.legacy_message_size > self.max_message_size {
            bail!(
                "legacy_message_size ({}) exceeds max_message_size ({})",
                self.legacy_message_size,
                self.max_message_size
            );
        }
        if self.max_messages == 0 {
            bail!("max_messages must be at least 1");
        }
        Ok(())
    }
}
