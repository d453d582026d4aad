//! # Verification Transaction
//!
//! State of one in-flight handshake and the phase machine it moves through.
//!
//! ```text
//!   AwaitingStart ──Accept──► Started ──Key──► KeyExchanged
//!   (initiator)               ▲  (responder        │
//!                             │   starts here)     ▼ SAS derived
//!                             │            AwaitingSasConfirmation
//!                             │                    │ peer MAC first
//!                             │                    ▼
//!                             │              MacExchanged
//!                             │                    │ both halves in
//!                             │                    ▼
//!   any non-terminal ──────────────────────► Verified | Cancelled
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::task::AbortHandle;

use crate::crypto::SasKeyAgreement;

use super::error::CancelCode;
use super::hooks::VerificationHooks;
use super::message::{DeviceIdentity, MacContent, SasMethod, TransactionId};
use super::methods::SasCode;
use super::store::TransactionKey;
use super::timeout::{Deadline, Supervised};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Where a transaction is in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// We sent Start and wait for the peer's Accept.
    AwaitingStart,
    /// Parameters agreed; waiting for the peer's ephemeral key.
    Started,
    /// Both ephemeral keys known.
    KeyExchanged,
    /// The SAS is with the human.
    AwaitingSasConfirmation,
    /// The peer's MAC arrived before the human answered.
    MacExchanged,
    /// The peer's device key is verified.
    Verified,
    /// The transaction ended without verifying.
    Cancelled {
        /// Cancel code.
        code: CancelCode,
        /// Human-readable reason.
        reason: String,
    },
}

impl Phase {
    /// Whether the transaction is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Cancelled { .. })
    }

    /// Whether `next` is a legal successor of this phase.
    pub fn can_transition_to(&self, next: &Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Verified, _) | (Cancelled { .. }, _) => false,
            (_, Cancelled { .. }) => true,
            (AwaitingStart, Started) => true,
            (Started, KeyExchanged) => true,
            (KeyExchanged, AwaitingSasConfirmation) => true,
            (AwaitingSasConfirmation, MacExchanged) => true,
            (AwaitingSasConfirmation, Verified) => true,
            (MacExchanged, Verified) => true,
            _ => false,
        }
    }

    /// Whether both ephemeral keys have been exchanged.
    pub fn keys_exchanged(&self) -> bool {
        matches!(
            self,
            Self::KeyExchanged | Self::AwaitingSasConfirmation | Self::MacExchanged
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingStart => f.write_str("awaiting-start"),
            Self::Started => f.write_str("started"),
            Self::KeyExchanged => f.write_str("key-exchanged"),
            Self::AwaitingSasConfirmation => f.write_str("awaiting-sas-confirmation"),
            Self::MacExchanged => f.write_str("mac-exchanged"),
            Self::Verified => f.write_str("verified"),
            Self::Cancelled { code, .. } => write!(f, "cancelled({})", code),
        }
    }
}

// ---------------------------------------------------------------------------
// MAC Join
// ---------------------------------------------------------------------------

/// The two inputs final verification waits for: the human's answer and the
/// peer's MAC. Each half is written at most once.
#[derive(Debug, Default)]
pub struct MacJoin {
    local: Option<bool>,
    peer: Option<MacContent>,
}

impl MacJoin {
    /// Record the human's answer. Returns `false` if it was already recorded.
    pub fn record_local(&mut self, matched: bool) -> bool {
        if self.local.is_some() {
            return false;
        }
        self.local = Some(matched);
        true
    }

    /// Record the peer's MAC. Returns `false` if one was already recorded.
    pub fn record_peer(&mut self, mac: MacContent) -> bool {
        if self.peer.is_some() {
            return false;
        }
        self.peer = Some(mac);
        true
    }

    /// The human's answer, if given.
    pub fn local(&self) -> Option<bool> {
        self.local
    }

    /// The peer's MAC, if received.
    pub fn peer(&self) -> Option<&MacContent> {
        self.peer.as_ref()
    }

    /// Both halves, once both are in.
    pub fn ready(&self) -> Option<(bool, &MacContent)> {
        match (self.local, self.peer.as_ref()) {
            (Some(local), Some(peer)) => Some((local, peer)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// One handshake with one peer device.
pub struct VerificationTransaction {
    /// Transaction id.
    pub id: TransactionId,
    /// The device being verified.
    pub peer: DeviceIdentity,
    /// Our ephemeral key agreement; owns the peer key once set.
    pub sas: SasKeyAgreement,
    /// Whether we sent the Start.
    pub initiated_by_us: bool,
    /// Current phase.
    pub phase: Phase,
    /// SAS methods our hooks offer, decimal guaranteed.
    pub our_methods: Vec<SasMethod>,
    /// Method used to derive the SAS, chosen once during negotiation.
    pub chosen_method: Option<SasMethod>,
    /// Commitment received in Accept (initiator only).
    pub commitment: Option<String>,
    /// Canonical JSON of the Start we sent (initiator only).
    pub start_canonical: Option<String>,
    /// The derived SAS, once keys are exchanged.
    pub sas_code: Option<SasCode>,
    /// Human answer and peer MAC.
    pub join: MacJoin,
    /// Host callbacks.
    pub hooks: Arc<dyn VerificationHooks>,
    /// Idle deadline.
    pub deadline: Deadline,
    /// Timer task, aborted when the transaction ends.
    pub timer: Option<AbortHandle>,
}

impl VerificationTransaction {
    /// A transaction we start; it waits for the peer's Accept.
    pub fn outgoing(
        id: TransactionId,
        peer: DeviceIdentity,
        hooks: Arc<dyn VerificationHooks>,
        our_methods: Vec<SasMethod>,
        deadline: Deadline,
    ) -> Self {
        Self::new(id, peer, hooks, our_methods, deadline, true, Phase::AwaitingStart)
    }

    /// A transaction the peer started; parameters are agreed on creation.
    pub fn incoming(
        id: TransactionId,
        peer: DeviceIdentity,
        hooks: Arc<dyn VerificationHooks>,
        our_methods: Vec<SasMethod>,
        chosen_method: SasMethod,
        deadline: Deadline,
    ) -> Self {
        let mut txn = Self::new(id, peer, hooks, our_methods, deadline, false, Phase::Started);
        txn.chosen_method = Some(chosen_method);
        txn
    }

    fn new(
        id: TransactionId,
        peer: DeviceIdentity,
        hooks: Arc<dyn VerificationHooks>,
        our_methods: Vec<SasMethod>,
        deadline: Deadline,
        initiated_by_us: bool,
        phase: Phase,
    ) -> Self {
        Self {
            id,
            peer,
            sas: SasKeyAgreement::generate_keypair(),
            initiated_by_us,
            phase,
            our_methods,
            chosen_method: None,
            commitment: None,
            start_canonical: None,
            sas_code: None,
            join: MacJoin::default(),
            hooks,
            deadline,
            timer: None,
        }
    }

    /// The store key of this transaction.
    pub fn key(&self) -> TransactionKey {
        TransactionKey::new(self.peer.user_id.clone(), self.id.clone())
    }

    /// Move to `next` if the edge is legal. Returns whether it moved.
    pub fn advance(&mut self, next: Phase) -> bool {
        if !self.phase.can_transition_to(&next) {
            return false;
        }
        self.phase = next;
        true
    }

    /// Stop the timer task, if any.
    pub fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Supervised for VerificationTransaction {
    fn deadline(&self) -> Option<&Deadline> {
        (!self.phase.is_terminal()).then_some(&self.deadline)
    }
}

impl fmt::Debug for VerificationTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationTransaction")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("initiated_by_us", &self.initiated_by_us)
            .field("phase", &self.phase)
            .field("chosen_method", &self.chosen_method)
            .finish_non_exhaustive()
    }
}
