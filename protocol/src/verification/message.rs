//! # Wire Messages
//!
//! The six to-device messages of the SAS handshake, plus the identifiers and
//! device descriptors they refer to.
//!
//! ```text
//!   ┌───────────┐                                   ┌───────────┐
//!   │ Initiator │                                   │ Responder │
//!   └─────┬─────┘                                   └─────┬─────┘
//!         │  (Request) ◄──────────────────────────────────┤  optional
//!         │  Start (methods)                              │
//!         ├──────────────────────────────────────────────►│
//!         │  Accept (chosen methods, commitment)          │
//!         │◄──────────────────────────────────────────────┤
//!         │  Key (initiator ephemeral key)                │
//!         ├──────────────────────────────────────────────►│
//!         │  Key (responder ephemeral key)                │
//!         │◄──────────────────────────────────────────────┤
//!         │          humans compare the SAS               │
//!         │  Mac ◄────────────────────────────────────►   │
//!         │                                               │
//! ```
//!
//! Any side may send Cancel at any point.
//!
//! Method identifiers keep values we do not understand verbatim. That
//! matters: the responder re-serializes the Start it received to compute the
//! commitment, and dropping or renaming an unknown entry would change the
//! bytes.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::config::{self, device_key_id};

use super::error::CancelCode;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id! {
    /// A user, the owner of one or more devices (e.g. `@alice:example.org`).
    UserId
}

string_id! {
    /// One device of a user.
    DeviceId
}

string_id! {
    /// Identifies one verification attempt between two devices.
    TransactionId
}

impl DeviceId {
    /// The device id that addresses every device of a user.
    pub fn wildcard() -> Self {
        Self(config::WILDCARD_DEVICE.to_string())
    }

    /// Whether this is the wildcard device id.
    pub fn is_wildcard(&self) -> bool {
        self.0 == config::WILDCARD_DEVICE
    }
}

impl TransactionId {
    /// A fresh random transaction id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// A remote device as known to the local device store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Owner of the device.
    pub user_id: UserId,
    /// The device id.
    pub device_id: DeviceId,
    /// The device's Ed25519 signing key, unpadded base64. This is the key
    /// whose authenticity the handshake establishes.
    pub signing_key: String,
}

impl DeviceIdentity {
    /// Describe a device with the given signing key.
    pub fn new(
        user_id: impl Into<UserId>,
        device_id: impl Into<DeviceId>,
        signing_key: &VerifyingKey,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            signing_key: STANDARD_NO_PAD.encode(signing_key.as_bytes()),
        }
    }

    /// Key id under which this device's signing key is MACed.
    pub fn key_id(&self) -> String {
        device_key_id(self.device_id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Method Identifiers
// ---------------------------------------------------------------------------

wire_enum! {
    /// Top-level verification method.
    VerificationMethod {
        /// Interactive short authentication string.
        SasV1 => config::METHOD_SAS_V1,
    }
}

wire_enum! {
    /// Key agreement protocol for the ephemeral keys.
    KeyAgreementProtocol {
        /// X25519 with HKDF-SHA256.
        Curve25519HkdfSha256 => config::KEY_AGREEMENT_CURVE25519_HKDF_SHA256,
    }
}

wire_enum! {
    /// Hash used for the commitment.
    HashMethod {
        /// SHA-256.
        Sha256 => config::HASH_SHA256,
    }
}

wire_enum! {
    /// MAC construction for the final key confirmation.
    MacMethod {
        /// HKDF-derived key with HMAC-SHA256.
        HkdfHmacSha256 => config::MAC_HKDF_HMAC_SHA256,
    }
}

wire_enum! {
    /// How the short authentication string is shown to humans.
    SasMethod {
        /// Three four-digit numbers.
        Decimal => config::SAS_DECIMAL,
        /// Seven emoji.
        Emoji => config::SAS_EMOJI,
    }
}

// ---------------------------------------------------------------------------
// Message Contents
// ---------------------------------------------------------------------------

/// `m.key.verification.request`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContent {
    /// Device asking for verification.
    pub from_device: DeviceId,
    /// Transaction id the eventual Start will reuse.
    pub transaction_id: TransactionId,
    /// Verification methods the requester supports.
    pub methods: Vec<VerificationMethod>,
    /// Milliseconds since the Unix epoch at which the request was made.
    pub timestamp: i64,
}

/// `m.key.verification.start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartContent {
    /// Device starting the verification.
    pub from_device: DeviceId,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Verification method; must be `m.sas.v1`.
    pub method: VerificationMethod,
    /// Key agreement protocols the initiator supports.
    pub key_agreement_protocols: Vec<KeyAgreementProtocol>,
    /// Hashes the initiator supports.
    pub hashes: Vec<HashMethod>,
    /// MAC methods the initiator supports.
    pub message_authentication_codes: Vec<MacMethod>,
    /// SAS methods the initiator supports, in preference order.
    pub short_authentication_string: Vec<SasMethod>,
}

impl StartContent {
    /// Whether the initiator offers the given key agreement protocol.
    pub fn supports_key_agreement(&self, protocol: &KeyAgreementProtocol) -> bool {
        self.key_agreement_protocols.contains(protocol)
    }

    /// Whether the initiator offers the given hash.
    pub fn supports_hash(&self, hash: &HashMethod) -> bool {
        self.hashes.contains(hash)
    }

    /// Whether the initiator offers the given MAC method.
    pub fn supports_mac(&self, mac: &MacMethod) -> bool {
        self.message_authentication_codes.contains(mac)
    }

    /// Whether the initiator offers the given SAS method.
    pub fn supports_sas(&self, method: &SasMethod) -> bool {
        self.short_authentication_string.contains(method)
    }
}

/// `m.key.verification.accept`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptContent {
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Verification method; must be `m.sas.v1`.
    pub method: VerificationMethod,
    /// Chosen key agreement protocol.
    pub key_agreement_protocol: KeyAgreementProtocol,
    /// Chosen hash.
    pub hash: HashMethod,
    /// Chosen MAC method.
    pub message_authentication_code: MacMethod,
    /// SAS methods both sides support, in the responder's order.
    pub short_authentication_string: Vec<SasMethod>,
    /// Hash of the responder's ephemeral key and the canonical Start.
    pub commitment: String,
}

/// `m.key.verification.key`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContent {
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Sender's ephemeral public key, unpadded base64.
    pub key: String,
}

/// `m.key.verification.mac`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacContent {
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// MAC of each key, by key id.
    pub mac: BTreeMap<String, String>,
    /// MAC of the sorted, comma-joined key id list.
    pub keys: String,
}

/// `m.key.verification.cancel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelContent {
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Human-readable reason.
    pub reason: String,
    /// Machine-readable code.
    pub code: CancelCode,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Any verification message, tagged with its event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum VerificationMessage {
    /// Ask a device to start verifying with us.
    #[serde(rename = "m.key.verification.request")]
    Request(RequestContent),
    /// Begin a SAS handshake.
    #[serde(rename = "m.key.verification.start")]
    Start(StartContent),
    /// Accept a Start and commit to an ephemeral key.
    #[serde(rename = "m.key.verification.accept")]
    Accept(AcceptContent),
    /// Reveal an ephemeral public key.
    #[serde(rename = "m.key.verification.key")]
    Key(KeyContent),
    /// Authenticate the long-term device key.
    #[serde(rename = "m.key.verification.mac")]
    Mac(MacContent),
    /// Abort the transaction.
    #[serde(rename = "m.key.verification.cancel")]
    Cancel(CancelContent),
}

impl VerificationMessage {
    /// The event type string of this message.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Request(_) => "m.key.verification.request",
            Self::Start(_) => "m.key.verification.start",
            Self::Accept(_) => "m.key.verification.accept",
            Self::Key(_) => "m.key.verification.key",
            Self::Mac(_) => "m.key.verification.mac",
            Self::Cancel(_) => "m.key.verification.cancel",
        }
    }

    /// The transaction this message belongs to.
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            Self::Request(c) => &c.transaction_id,
            Self::Start(c) => &c.transaction_id,
            Self::Accept(c) => &c.transaction_id,
            Self::Key(c) => &c.transaction_id,
            Self::Mac(c) => &c.transaction_id,
            Self::Cancel(c) => &c.transaction_id,
        }
    }
}
