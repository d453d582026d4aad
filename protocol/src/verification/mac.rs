//! # Commitment & MAC Calculation
//!
//! Pure functions over [`SasKeyAgreement`] that produce the two values the
//! peer recomputes independently: the commitment (responder → initiator) and
//! the key MACs (both directions).
//!
//! Both constructions are plain concatenations without delimiters. The
//! order of the parts is the wire contract; a reordering still produces a
//! perfectly good MAC that the peer will never match.
//!
//! ```text
//! commitment   = base64(SHA-256(responder_key ‖ canonical_start))
//! info         = "MATRIX_KEY_VERIFICATION_MAC"
//!                ‖ sender_user ‖ sender_device
//!                ‖ receiver_user ‖ receiver_device
//!                ‖ transaction_id
//! key_mac      = MAC(signing_key, info ‖ key_id)
//! key_list_mac = MAC(sorted(key_ids).join(","), info ‖ "KEY_IDS")
//! ```

use tracing::trace;

use crate::config::{KEY_IDS_INFO_SUFFIX, MAC_INFO_LABEL};
use crate::crypto::{sha256_base64, CryptoError, SasKeyAgreement};

use super::message::{DeviceId, TransactionId, UserId};

/// Commitment over the responder's ephemeral key and the canonical Start.
pub fn commitment(responder_key: &str, canonical_start: &str) -> String {
    let mut input = String::with_capacity(responder_key.len() + canonical_start.len());
    input.push_str(responder_key);
    input.push_str(canonical_start);
    sha256_base64(input.as_bytes())
}

/// MAC `key_material` under the given info string.
pub fn mac(sas: &SasKeyAgreement, key_material: &[u8], info: &[u8]) -> Result<String, CryptoError> {
    sas.calculate_mac(key_material, info)
}

/// The parties a MAC is bound to, in sender → receiver direction.
#[derive(Debug, Clone, Copy)]
pub struct MacParties<'a> {
    /// User whose key is being MACed.
    pub sender_user: &'a UserId,
    /// Device whose key is being MACed.
    pub sender_device: &'a DeviceId,
    /// User that will check the MAC.
    pub receiver_user: &'a UserId,
    /// Device that will check the MAC.
    pub receiver_device: &'a DeviceId,
    /// Transaction the MAC belongs to.
    pub transaction_id: &'a TransactionId,
}

impl MacParties<'_> {
    /// The shared prefix of both MAC info strings.
    pub fn base_info(&self) -> String {
        let mut info = String::from(MAC_INFO_LABEL);
        info.push_str(self.sender_user.as_str());
        info.push_str(self.sender_device.as_str());
        info.push_str(self.receiver_user.as_str());
        info.push_str(self.receiver_device.as_str());
        info.push_str(self.transaction_id.as_str());
        info
    }
}

/// The MAC pair carried by a Mac message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMacs {
    /// MAC of the signing key itself.
    pub key_mac: String,
    /// MAC of the key id list.
    pub key_list_mac: String,
}

/// Join key ids the way the key-list MAC expects them: sorted, comma
/// separated.
pub fn key_id_list<'a>(key_ids: impl IntoIterator<Item = &'a str>) -> String {
    let mut ids: Vec<&str> = key_ids.into_iter().collect();
    ids.sort_unstable();
    ids.join(",")
}

/// Compute the key MAC for `signing_key` under `key_id`, and the key-list MAC
/// over `key_ids`.
///
/// The sender passes just its own key id; the receiver passes the key ids of
/// the map it received, so a peer that MACed extra keys still produces a
/// matching list MAC.
pub fn key_macs<'a>(
    sas: &SasKeyAgreement,
    parties: &MacParties<'_>,
    signing_key: &str,
    key_id: &str,
    key_ids: impl IntoIterator<Item = &'a str>,
) -> Result<KeyMacs, CryptoError> {
    let base = parties.base_info();

    let key_info = format!("{}{}", base, key_id);
    let key_mac = mac(sas, signing_key.as_bytes(), key_info.as_bytes())?;
    trace!(info = %key_info, mac = %key_mac, "computed key MAC");

    let list = key_id_list(key_ids);
    let list_info = format!("{}{}", base, KEY_IDS_INFO_SUFFIX);
    let key_list_mac = mac(sas, list.as_bytes(), list_info.as_bytes())?;
    trace!(info = %list_info, keys = %list, mac = %key_list_mac, "computed key list MAC");

    Ok(KeyMacs {
        key_mac,
        key_list_mac,
    })
}
