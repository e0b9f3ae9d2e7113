//! # Identity and Signed Address Records
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as the peer's unique identifier
//! - [`SignedAddressRecord`]: signed attestation binding a set of listen
//!   addresses to an identity
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key.** Possession of the private key proves
//! the identity; no external CA is involved.
//!
//! ## Address Records
//!
//! A [`SignedAddressRecord`] is the signed part of an identify snapshot. Its
//! payload is `identity(32) || addr_count(4) || [addr_len(4) || addr]* || timestamp(8)`,
//! signed under [`ADDRESS_RECORD_SIGNATURE_DOMAIN`]. The timestamp doubles
//! as a sequence number: a newer record for the same identity always carries
//! a larger timestamp.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{ADDRESS_RECORD_SIGNATURE_DOMAIN, SignatureError};

/// Returns current time as milliseconds since Unix epoch.
/// Used for timestamp generation in signed records.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Sign the given listen addresses into a fresh address record.
    pub fn sign_address_record(&self, addrs: Vec<String>) -> SignedAddressRecord {
        let identity = self.identity();
        let timestamp = now_ms();

        let payload = SignedAddressRecord::build_signed_payload(&identity, &addrs, timestamp);
        let signature = crate::crypto::sign_with_domain(self, ADDRESS_RECORD_SIGNATURE_DOMAIN, &payload);

        SignedAddressRecord {
            identity,
            addrs,
            timestamp,
            signature,
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short hex prefix (first 8 bytes) used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check that this identity is a usable Ed25519 public key.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Signed attestation of the address set a node advertises.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAddressRecord {
    pub identity: Identity,
    pub addrs: Vec<String>,
    /// Milliseconds since Unix epoch at signing time.
    pub timestamp: u64,
    /// Ed25519 signature over the canonical payload.
    pub signature: Vec<u8>,
}

impl SignedAddressRecord {
    /// Verify the record's signature against its own identity.
    pub fn verify(&self) -> Result<(), SignatureError> {
        if self.signature.is_empty() || self.timestamp == 0 {
            return Err(SignatureError::Missing);
        }

        let payload = Self::build_signed_payload(&self.identity, &self.addrs, self.timestamp);
        crate::crypto::verify_with_domain(
            &self.identity,
            ADDRESS_RECORD_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }

    /// Build the canonical payload for address record signatures.
    ///
    /// The domain prefix is added by the crypto layer.
    #[doc(hidden)]
    pub fn build_signed_payload(identity: &Identity, addrs: &[String], timestamp: u64) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(identity.as_bytes());
        data.extend_from_slice(&(addrs.len() as u32).to_le_bytes());
        for addr in addrs {
            let addr_bytes = addr.as_bytes();
            data.extend_from_slice(&(addr_bytes.len() as u32).to_le_bytes());
            data.extend_from_slice(addr_bytes);
        }
        data.extend_from_slice(&timestamp.to_le_bytes());
        data
    }
}
