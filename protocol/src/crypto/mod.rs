//! # Cryptographic Primitives for keytrust
//!
//! Everything the verification handshake needs from cryptography, and
//! nothing more:
//!
//! - **X25519** for the ephemeral key agreement.
//! - **HKDF-SHA256** to turn the shared secret into SAS bytes and MAC keys.
//! - **HMAC-SHA256** to authenticate long-term device keys.
//! - **SHA-256** for the commitment.
//! - **Canonical JSON** so both devices hash the same bytes.
//!
//! ## A note on "rolling your own crypto"
//!
//! We don't. Everything here is a thin, type-safe wrapper around audited
//! RustCrypto and dalek implementations.

pub mod canonical;
pub mod hash;
pub mod sas;

pub use canonical::canonical_json;
pub use hash::{sha256_array, sha256_base64};
pub use sas::{CryptoError, SasKeyAgreement};
