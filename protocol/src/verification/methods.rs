//! # SAS Code Derivation
//!
//! Turns the shared secret into something a human can compare. Both devices
//! feed the same info string to HKDF, with the **initiator's** identity and
//! key first regardless of which side is computing:
//!
//! ```text
//! "MATRIX_KEY_VERIFICATION_SAS"
//!   ‖ init_user ‖ init_device ‖ init_key
//!   ‖ accept_user ‖ accept_device ‖ accept_key
//!   ‖ transaction_id
//! ```
//!
//! - **decimal**: 5 bytes → three 13-bit numbers, each offset by 1000.
//! - **emoji**: 6 bytes → seven 6-bit indices into a fixed 64-entry table.

use std::fmt;

use crate::config::{SAS_DECIMAL_BYTES, SAS_EMOJI_BYTES, SAS_INFO_LABEL};
use crate::crypto::{CryptoError, SasKeyAgreement};

use super::message::{DeviceId, SasMethod, TransactionId, UserId};

/// One emoji of the SAS alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emoji {
    /// The emoji itself.
    pub symbol: &'static str,
    /// English name, for screen readers and for humans reading aloud.
    pub description: &'static str,
}

const fn emoji(symbol: &'static str, description: &'static str) -> Emoji {
    Emoji {
        symbol,
        description,
    }
}

/// The 64 emoji, indexed by 6-bit value.
pub const EMOJI_TABLE: [Emoji; 64] = [
    emoji("🐶", "Dog"),
    emoji("🐱", "Cat"),
    emoji("🦁", "Lion"),
    emoji("🐎", "Horse"),
    emoji("🦄", "Unicorn"),
    emoji("🐷", "Pig"),
    emoji("🐘", "Elephant"),
    emoji("🐰", "Rabbit"),
    emoji("🐼", "Panda"),
    emoji("🐓", "Rooster"),
    emoji("🐧", "Penguin"),
    emoji("🐢", "Turtle"),
    emoji("🐟", "Fish"),
    emoji("🐙", "Octopus"),
    emoji("🦋", "Butterfly"),
    emoji("🌷", "Flower"),
    emoji("🌳", "Tree"),
    emoji("🌵", "Cactus"),
    emoji("🍄", "Mushroom"),
    emoji("🌏", "Globe"),
    emoji("🌙", "Moon"),
    emoji("☁️", "Cloud"),
    emoji("🔥", "Fire"),
    emoji("🍌", "Banana"),
    emoji("🍎", "Apple"),
    emoji("🍓", "Strawberry"),
    emoji("🌽", "Corn"),
    emoji("🍕", "Pizza"),
    emoji("🎂", "Cake"),
    emoji("❤️", "Heart"),
    emoji("😀", "Smiley"),
    emoji("🤖", "Robot"),
    emoji("🎩", "Hat"),
    emoji("👓", "Glasses"),
    emoji("🔧", "Spanner"),
    emoji("🎅", "Santa"),
    emoji("👍", "Thumbs Up"),
    emoji("☂️", "Umbrella"),
    emoji("⌛", "Hourglass"),
    emoji("⏰", "Clock"),
    emoji("🎁", "Gift"),
    emoji("💡", "Light Bulb"),
    emoji("📕", "Book"),
    emoji("✏️", "Pencil"),
    emoji("📎", "Paperclip"),
    emoji("✂️", "Scissors"),
    emoji("🔒", "Lock"),
    emoji("🔑", "Key"),
    emoji("🔨", "Hammer"),
    emoji("☎️", "Telephone"),
    emoji("🏁", "Flag"),
    emoji("🚂", "Train"),
    emoji("🚲", "Bicycle"),
    emoji("✈️", "Aeroplane"),
    emoji("🚀", "Rocket"),
    emoji("🏆", "Trophy"),
    emoji("⚽", "Ball"),
    emoji("🎸", "Guitar"),
    emoji("🎺", "Trumpet"),
    emoji("🔔", "Bell"),
    emoji("⚓", "Anchor"),
    emoji("🎧", "Headphones"),
    emoji("📁", "Folder"),
    emoji("📌", "Pin"),
];

/// A short authentication string ready to show to a human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SasCode {
    /// Three numbers in 1000..=9191.
    Decimal([u16; 3]),
    /// Seven emoji.
    Emoji([Emoji; 7]),
}

impl SasCode {
    /// The method that produced this code.
    pub fn method(&self) -> SasMethod {
        match self {
            Self::Decimal(_) => SasMethod::Decimal,
            Self::Emoji(_) => SasMethod::Emoji,
        }
    }
}

impl fmt::Display for SasCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decimal([a, b, c]) => write!(f, "{} {} {}", a, b, c),
            Self::Emoji(emojis) => {
                let rendered: Vec<String> = emojis
                    .iter()
                    .map(|e| format!("{} ({})", e.symbol, e.description))
                    .collect();
                f.write_str(&rendered.join(" "))
            }
        }
    }
}

/// Identity and ephemeral key of one party, as fed into the SAS info string.
#[derive(Debug, Clone, Copy)]
pub struct SasParty<'a> {
    /// Owner of the device.
    pub user_id: &'a UserId,
    /// The device.
    pub device_id: &'a DeviceId,
    /// Ephemeral public key, unpadded base64.
    pub key: &'a str,
}

/// Build the HKDF info string for SAS derivation.
pub fn sas_info(
    initiator: &SasParty<'_>,
    responder: &SasParty<'_>,
    transaction_id: &TransactionId,
) -> String {
    let mut info = String::from(SAS_INFO_LABEL);
    for party in [initiator, responder] {
        info.push_str(party.user_id.as_str());
        info.push_str(party.device_id.as_str());
        info.push_str(party.key);
    }
    info.push_str(transaction_id.as_str());
    info
}

/// Derive the SAS for `method`.
///
/// Fails with [`CryptoError::MissingSharedSecret`] before the peer key is
/// known. An `Other` method falls back to decimal, which every device
/// supports; negotiation never selects one.
pub fn derive(
    method: &SasMethod,
    initiator: &SasParty<'_>,
    responder: &SasParty<'_>,
    transaction_id: &TransactionId,
    sas: &SasKeyAgreement,
) -> Result<SasCode, CryptoError> {
    let info = sas_info(initiator, responder, transaction_id);
    match method {
        SasMethod::Emoji => {
            let bytes = sas.derive_sas_bytes(info.as_bytes(), SAS_EMOJI_BYTES)?;
            Ok(SasCode::Emoji(emoji_from_bytes(&bytes)))
        }
        SasMethod::Decimal | SasMethod::Other(_) => {
            let bytes = sas.derive_sas_bytes(info.as_bytes(), SAS_DECIMAL_BYTES)?;
            Ok(SasCode::Decimal(decimal_from_bytes(&bytes)))
        }
    }
}

fn decimal_from_bytes(b: &[u8]) -> [u16; 3] {
    let (b0, b1, b2, b3, b4) = (b[0] as u16, b[1] as u16, b[2] as u16, b[3] as u16, b[4] as u16);
    [
        ((b0 << 5) | (b1 >> 3)) + 1000,
        (((b1 & 0x07) << 10) | (b2 << 2) | (b3 >> 6)) + 1000,
        (((b3 & 0x3F) << 7) | (b4 >> 1)) + 1000,
    ]
}

fn emoji_from_bytes(b: &[u8]) -> [Emoji; 7] {
    let bits = b.iter().fold(0u64, |acc, byte| (acc << 8) | *byte as u64);
    // 48 bits of input; the first 42 select seven emoji.
    std::array::from_fn(|i| EMOJI_TABLE[((bits >> (42 - 6 * i)) & 0x3F) as usize])
}

/// Intersect our methods with the peer's, keeping OUR order.
pub fn common_methods(ours: &[SasMethod], theirs: &[SasMethod]) -> Vec<SasMethod> {
    ours.iter()
        .filter(|m| !matches!(m, SasMethod::Other(_)) && theirs.contains(m))
        .cloned()
        .collect()
}

/// Ensure the mandatory decimal method is on the list.
pub fn with_mandatory_decimal(mut methods: Vec<SasMethod>) -> Vec<SasMethod> {
    if !methods.contains(&SasMethod::Decimal) {
        methods.push(SasMethod::Decimal);
    }
    methods
}
