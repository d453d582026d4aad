// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # keytrust: Interactive Device Verification
//!
//! Two devices that each hold a signing key for the other need a way to
//! check that nobody swapped those keys in transit. keytrust runs the SAS
//! handshake: an ephemeral X25519 agreement whose output is rendered as a
//! short string (numbers or emoji) that two humans compare side by side.
//! When both say "match", each device MACs its long-term key with the
//! shared secret and the peer's key is marked verified.
//!
//! ## Architecture
//!
//! - **config**: Protocol identifiers, info-string labels, default timeouts.
//! - **crypto**: The key agreement box, SHA-256 commitments, canonical JSON.
//! - **verification**: Wire messages, the per-transaction state machine,
//!   the engine that dispatches inbound messages, and the collaborator traits
//!   a host implements (transport, device store, UI hooks).
//!
//! ## Design Philosophy
//!
//! 1. Byte-exact wire compatibility. Every info string and commitment input
//!    is a plain concatenation, and the order is part of the protocol.
//! 2. One lock per transaction. Unrelated verifications never wait on each
//!    other, and messages of one verification are applied in order.
//! 3. A protocol violation always ends the transaction on both sides.

pub mod config;
pub mod crypto;
pub mod verification;

pub use verification::{OwnDevice, VerificationEngine};
