//! # Protocol Configuration & Constants
//!
//! Every identifier that goes on the wire lives here. The verification
//! handshake is only useful if both devices agree on these strings byte for
//! byte, so if you're hardcoding one somewhere else, you're doing it wrong
//! and you owe the team coffee.
//!
//! Runtime knobs (timeouts, request freshness) live in [`VerificationConfig`].

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate-level protocol version string, reported by the node binary.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Negotiated Method Identifiers
// ---------------------------------------------------------------------------

/// The only verification method we speak: interactive SAS, version 1.
pub const METHOD_SAS_V1: &str = "m.sas.v1";

/// Key agreement: X25519, with HKDF-SHA256 for every derived byte.
pub const KEY_AGREEMENT_CURVE25519_HKDF_SHA256: &str = "curve25519-hkdf-sha256";

/// Hash used for the commitment.
pub const HASH_SHA256: &str = "sha256";

/// MAC construction: HKDF-derived key, then HMAC-SHA256.
pub const MAC_HKDF_HMAC_SHA256: &str = "hkdf-hmac-sha256";

/// SAS rendering as three four-digit numbers. Mandatory for every device.
pub const SAS_DECIMAL: &str = "decimal";

/// SAS rendering as seven emoji.
pub const SAS_EMOJI: &str = "emoji";

// ---------------------------------------------------------------------------
// Derivation Labels
// ---------------------------------------------------------------------------

/// Prefix of the HKDF info string used to derive SAS bytes.
pub const SAS_INFO_LABEL: &str = "MATRIX_KEY_VERIFICATION_SAS";

/// Prefix of the HKDF info string used to derive MAC keys.
pub const MAC_INFO_LABEL: &str = "MATRIX_KEY_VERIFICATION_MAC";

/// Suffix that marks the key-id-list MAC, in place of a key id.
pub const KEY_IDS_INFO_SUFFIX: &str = "KEY_IDS";

/// Algorithm prefix for device signing key ids (`ed25519:DEVICEID`).
pub const KEY_ALGORITHM_ED25519: &str = "ed25519";

/// Device id that addresses every device of a user. Used when we have to
/// answer a message for a transaction we know nothing about.
pub const WILDCARD_DEVICE: &str = "*";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// X25519 public key length in bytes.
pub const X25519_PUBLIC_KEY_LENGTH: usize = 32;

/// HKDF output used as the HMAC key for each MAC.
pub const MAC_KEY_LENGTH: usize = 32;

/// Bytes of SAS material consumed by the decimal method (3 x 13 bits).
pub const SAS_DECIMAL_BYTES: usize = 5;

/// Bytes of SAS material consumed by the emoji method (7 x 6 bits).
pub const SAS_EMOJI_BYTES: usize = 6;

// ---------------------------------------------------------------------------
// Timing Constants
// ---------------------------------------------------------------------------

/// How long a transaction may sit idle before it is cancelled with
/// `m.timeout`. Every valid inbound message pushes the deadline forward.
/// Ten minutes leaves room for a human to find their other phone.
pub const DEFAULT_SAS_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Requests older than this are ignored.
pub const DEFAULT_REQUEST_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Requests stamped further than this in the future are ignored. Clocks
/// drift; five minutes of drift is already a lot.
pub const DEFAULT_REQUEST_MAX_FUTURE: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Tunable parameters for a [`crate::verification::VerificationEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationConfig {
    /// Idle timeout applied to each transaction unless the caller overrides
    /// it for a specific transaction.
    pub sas_timeout: Duration,
    /// Maximum age of an inbound verification request.
    pub request_max_age: Duration,
    /// Maximum clock lead of an inbound verification request.
    pub request_max_future: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            sas_timeout: DEFAULT_SAS_TIMEOUT,
            request_max_age: DEFAULT_REQUEST_MAX_AGE,
            request_max_future: DEFAULT_REQUEST_MAX_FUTURE,
        }
    }
}

impl VerificationConfig {
    /// Set the default per-transaction timeout.
    pub fn with_sas_timeout(mut self, timeout: Duration) -> Self {
        self.sas_timeout = timeout;
        self
    }

    /// Set the freshness window for inbound requests.
    pub fn with_request_window(mut self, max_age: Duration, max_future: Duration) -> Self {
        self.request_max_age = max_age;
        self.request_max_future = max_future;
        self
    }
}

/// Build the key id under which a device's signing key is MACed.
pub fn device_key_id(device_id: &str) -> String {
    format!("{}:{}", KEY_ALGORITHM_ED25519, device_id)
}
