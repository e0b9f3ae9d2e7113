//! # Identify Wire Messages
//!
//! The identify message and its framing. Messages are serialized using
//! bincode with size limits to prevent memory exhaustion.
//!
//! ## Framing
//!
//! Each frame is `length(4, big-endian) || bincode(IdentifyMessage)`. A single
//! logical message may span several frames: when a signed address record
//! would push the encoded message past the legacy size, the message is sent
//! without the record first and the record follows in a frame of its own.
//! Readers merge up to a bounded number of frames back into one message.

use anyhow::{Context, Result, bail};
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::config::IdentifyConfig;
use crate::identity::{Identity, SignedAddressRecord};
use crate::protocols::PushStream;
use crate::snapshot::IdentifySnapshot;

const LENGTH_PREFIX: usize = 4;

fn bincode_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T, bincode::Error> {
    bincode_options(limit as u64).deserialize(bytes)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyMessage {
    pub protocol_version: Option<String>,
    pub agent_version: Option<String>,
    pub public_key: Option<Identity>,
    pub listen_addrs: Vec<String>,
    /// The address we observe the remote peer connecting from.
    pub observed_addr: Option<String>,
    pub protocols: Vec<String>,
    pub signed_record: Option<SignedAddressRecord>,
}

impl IdentifyMessage {
    pub fn from_snapshot(
        snapshot: &IdentifySnapshot,
        config: &IdentifyConfig,
        public_key: Identity,
        observed_addr: Option<String>,
    ) -> Self {
        Self {
            protocol_version: Some(config.protocol_version.clone()),
            agent_version: Some(config.agent_version.clone()),
            public_key: Some(public_key),
            listen_addrs: snapshot.addrs.clone(),
            observed_addr,
            protocols: snapshot.protocols.clone(),
            signed_record: if config.disable_signed_records {
                None
            } else {
                snapshot.record.clone()
            },
        }
    }

    /// Fold a later frame into this message. Non-empty fields of `next` win.
    pub fn merge(&mut self, next: IdentifyMessage) {
        if next.protocol_version.is_some() {
            self.protocol_version = next.protocol_version;
        }
        if next.agent_version.is_some() {
            self.agent_version = next.agent_version;
        }
        if next.public_key.is_some() {
            self.public_key = next.public_key;
        }
        if !next.listen_addrs.is_empty() {
            self.listen_addrs = next.listen_addrs;
        }
        if next.observed_addr.is_some() {
            self.observed_addr = next.observed_addr;
        }
        if !next.protocols.is_empty() {
            self.protocols = next.protocols;
        }
        if next.signed_record.is_some() {
            self.signed_record = next.signed_record;
        }
    }

    /// The signed record, if it verifies and was signed by `expected`.
    pub fn verified_record(&self, expected: &Identity) -> Option<&SignedAddressRecord> {
        let record = self.signed_record.as_ref()?;
        if record.identity != *expected {
            return None;
        }
        record.verify().ok()?;
        Some(record)
    }

    fn encoded_len(&self) -> Result<usize> {
        Ok(bincode_options(u64::MAX).serialized_size(self)? as usize)
    }
}

/// Encode one message as a length-prefixed frame.
pub fn encode_frame(message: &IdentifyMessage) -> Result<Vec<u8>> {
    let body = bincode_options(u64::MAX)
        .serialize(message)
        .context("failed to serialize identify message")?;
    let len = u32::try_from(body.len()).context("identify message too large to frame")?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write `message` to `stream`, splitting off the signed record when the
/// full message exceeds `legacy_size`.
pub async fn write_chunked<S>(stream: &mut S, mut message: IdentifyMessage, legacy_size: usize) -> Result<()>
where
    S: PushStream + ?Sized,
{
    if message.signed_record.is_none() || message.encoded_len()? <= legacy_size {
        return stream.write_all(&encode_frame(&message)?).await;
    }

    let record = message.signed_record.take();
    stream.write_all(&encode_frame(&message)?).await?;

    let record_only = IdentifyMessage {
        signed_record: record,
        ..IdentifyMessage::default()
    };
    stream.write_all(&encode_frame(&record_only)?).await
}

/// Decode and merge up to `max_messages` frames from `bytes`.
pub fn decode_identify_frames(bytes: &[u8], max_message_size: usize, max_messages: usize) -> Result<IdentifyMessage> {
    let mut merged = IdentifyMessage::default();
    let mut rest = bytes;
    let mut frames = 0;

    while !rest.is_empty() {
        if frames == max_messages {
            bail!("identify message spans more than {max_messages} frames");
        }
        if rest.len() < LENGTH_PREFIX {
            bail!("truncated identify frame header");
        }
        let (header, tail) = rest.split_at(LENGTH_PREFIX);
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > max_message_size {
            bail!("identify frame of {len} bytes exceeds limit of {max_message_size}");
        }
        if tail.len() < len {
            bail!("truncated identify frame: expected {len} bytes, have {}", tail.len());
        }
        let (body, tail) = tail.split_at(len);
        let frame: IdentifyMessage = deserialize_bounded(body, max_message_size)
            .context("failed to decode identify frame")?;
        merged.merge(frame);
        rest = tail;
        frames += 1;
    }

    if frames == 0 {
        bail!("empty identify message");
    }
    Ok(merged)
}
