//! # SAS Key Agreement
//!
//! The cryptographic box behind every verification transaction: one
//! ephemeral X25519 keypair, one peer public key, and everything derived from
//! the resulting shared secret.
//!
//! ## Protocol Flow
//!
//! 1. [`SasKeyAgreement::generate_keypair`] creates a fresh X25519 keypair.
//!    The public half travels in the `m.key.verification.key` message.
//! 2. [`SasKeyAgreement::set_peer_key`] performs the Diffie-Hellman exchange
//!    as soon as the peer's key arrives. The ephemeral secret is consumed
//!    here and cannot be used again.
//! 3. [`SasKeyAgreement::derive_sas_bytes`] expands the shared secret with
//!    HKDF-SHA256 into the bytes that become the short authentication string.
//! 4. [`SasKeyAgreement::calculate_mac`] derives a per-purpose MAC key with
//!    HKDF-SHA256 and authenticates a long-term key with HMAC-SHA256.
//!
//! ## Encoding
//!
//! Public keys and MACs are exchanged as unpadded standard base64. The
//! commitment hashes the *base64 string* of the key, so the encoding is part
//! of the wire contract, not a presentation detail.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};

use crate::config::{MAC_KEY_LENGTH, X25519_PUBLIC_KEY_LENGTH};

type HmacSha256 = Hmac<Sha256>;

/// Errors raised by the key agreement primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("peer public key is not valid unpadded base64: {0}")]
    InvalidKeyEncoding(String),

    #[error("peer public key has length {0}, expected 32")]
    InvalidKeyLength(usize),

    #[error("peer public key was already set")]
    PeerKeyAlreadySet,

    #[error("shared secret is not available until the peer key is set")]
    MissingSharedSecret,

    #[error("HKDF rejected output length {0}")]
    InvalidOutputLength(usize),
}

/// One side of an ephemeral X25519 agreement, plus the HKDF/HMAC operations
/// keyed by its shared secret.
pub struct SasKeyAgreement {
    /// Consumed by [`set_peer_key`](Self::set_peer_key).
    secret: Option<EphemeralSecret>,
    public_key: PublicKey,
    shared: Option<SharedSecret>,
    peer_public_key: Option<String>,
}

impl SasKeyAgreement {
    /// Generate a fresh ephemeral keypair from `OsRng`.
    pub fn generate_keypair() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public_key,
            shared: None,
            peer_public_key: None,
        }
    }

    /// Our public key as sent on the wire.
    pub fn public_key(&self) -> String {
        STANDARD_NO_PAD.encode(self.public_key.as_bytes())
    }

    /// The peer's public key exactly as it was received, once set.
    pub fn peer_public_key(&self) -> Option<&str> {
        self.peer_public_key.as_deref()
    }

    /// Whether [`set_peer_key`](Self::set_peer_key) has succeeded.
    pub fn has_peer_key(&self) -> bool {
        self.shared.is_some()
    }

    /// Decode the peer's public key and complete the Diffie-Hellman exchange.
    ///
    /// Write-once: a second call fails with [`CryptoError::PeerKeyAlreadySet`]
    /// and leaves the existing shared secret untouched. A malformed key does
    /// not consume the ephemeral secret.
    pub fn set_peer_key(&mut self, peer_key: &str) -> Result<(), CryptoError> {
        if self.shared.is_some() {
            return Err(CryptoError::PeerKeyAlreadySet);
        }
        let bytes = STANDARD_NO_PAD
            .decode(peer_key)
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        let bytes: [u8; X25519_PUBLIC_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;

        let secret = self.secret.take().ok_or(CryptoError::PeerKeyAlreadySet)?;
        self.shared = Some(secret.diffie_hellman(&PublicKey::from(bytes)));
        self.peer_public_key = Some(peer_key.to_string());
        Ok(())
    }

    /// Expand the shared secret into `len` bytes with HKDF-SHA256 (empty
    /// salt) under the given info string.
    pub fn derive_sas_bytes(&self, info: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
        let shared = self.shared.as_ref().ok_or(CryptoError::MissingSharedSecret)?;
        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut output = vec![0u8; len];
        hkdf.expand(info, &mut output)
            .map_err(|_| CryptoError::InvalidOutputLength(len))?;
        Ok(output)
    }

    /// MAC `input` under a key derived from the shared secret and `info`.
    ///
    /// Returns the HMAC-SHA256 tag as unpadded base64.
    pub fn calculate_mac(&self, input: &[u8], info: &[u8]) -> Result<String, CryptoError> {
        let key = self.derive_sas_bytes(info, MAC_KEY_LENGTH)?;
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|_| CryptoError::InvalidOutputLength(key.len()))?;
        mac.update(input);
        Ok(STANDARD_NO_PAD.encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for SasKeyAgreement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasKeyAgreement")
            .field("public_key", &self.public_key())
            .field("peer_public_key", &self.peer_public_key)
            .field("shared", &self.shared.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
