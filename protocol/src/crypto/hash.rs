//! # Hashing Utilities
//!
//! SHA-256 is the only hash the verification protocol negotiates, and it is
//! used for exactly one thing: the commitment the responder sends in its
//! Accept message. The digest is exchanged as unpadded base64, the same
//! encoding used for keys and MACs.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash and return a fixed-size array.
pub fn sha256_array(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Compute SHA-256 and encode the digest as unpadded base64.
///
/// # Example
///
/// ```
/// use keytrust_protocol::crypto::sha256_base64;
///
/// let digest = sha256_base64(b"");
/// assert_eq!(digest, "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU");
/// ```
pub fn sha256_base64(data: &[u8]) -> String {
    STANDARD_NO_PAD.encode(sha256_array(data))
}
