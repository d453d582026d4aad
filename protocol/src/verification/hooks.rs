//! Collaborator traits.
//!
//! The engine owns the protocol; everything else is supplied by the host:
//! how messages reach a device ([`Transport`]), where device keys and trust
//! live ([`DeviceStore`]), whether to take part in a verification at all
//! ([`VerificationHandler`]), and what the human says about the SAS
//! ([`VerificationHooks`]).

use std::sync::Arc;

use async_trait::async_trait;

use super::error::{CancelCode, StoreError, TransportError};
use super::message::{DeviceId, DeviceIdentity, SasMethod, TransactionId, UserId, VerificationMessage};
use super::methods::SasCode;

/// Per-transaction callbacks into the host UI.
#[async_trait]
pub trait VerificationHooks: Send + Sync {
    /// SAS methods we can display, in preference order. Must include
    /// `decimal`.
    fn supported_methods(&self) -> Vec<SasMethod>;

    /// Show `sas` to the human and report whether it matches the peer's
    /// screen. May take as long as the human needs; no lock is held.
    async fn confirm_sas(&self, peer: &DeviceIdentity, sas: &SasCode) -> bool;

    /// The transaction was cancelled, by us (`cancelled_by_us`) or the peer.
    async fn on_cancel(&self, cancelled_by_us: bool, reason: &str, code: &CancelCode);

    /// The peer device is now verified.
    async fn on_success(&self);
}

/// Answer to an incoming Request or Start.
#[derive(Clone)]
pub enum AcceptDecision {
    /// Take part, driving the transaction with these hooks.
    Accept(Arc<dyn VerificationHooks>),
    /// Decline; the peer receives a `m.user` cancel.
    Reject,
    /// Drop the message silently.
    Ignore,
}

impl std::fmt::Debug for AcceptDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept(_) => f.write_str("Accept"),
            Self::Reject => f.write_str("Reject"),
            Self::Ignore => f.write_str("Ignore"),
        }
    }
}

/// Decides whether to verify with a device that asked us to.
#[async_trait]
pub trait VerificationHandler: Send + Sync {
    /// Called for every acceptable incoming Request, and for every Start that
    /// does not answer a Request we sent.
    async fn accept_verification_from(
        &self,
        transaction_id: &TransactionId,
        device: &DeviceIdentity,
    ) -> AcceptDecision;
}

/// Delivers one message to one device (or every device, for `"*"`).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand `message` to the transport. Delivery is at most once.
    async fn send_to_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        message: &VerificationMessage,
    ) -> Result<(), TransportError>;
}

/// Long-term device keys and trust state.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Resolve a device and its signing key.
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceIdentity>;

    /// Record `device` as verified. Called once per successful handshake.
    async fn mark_verified(&self, device: &DeviceIdentity) -> Result<(), StoreError>;
}
