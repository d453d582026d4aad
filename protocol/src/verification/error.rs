//! Error types for the verification engine.
//!
//! Every engine operation that can fail returns a [`VerificationError`].
//! Protocol violations are not errors in the usual sense: they cancel the
//! transaction, tell the peer and the host, and are then reported back to
//! the caller as [`VerificationError::Cancelled`] so the dispatch loop can
//! log them.

use thiserror::Error;

use crate::crypto::CryptoError;

wire_enum! {
    /// Machine-readable reason carried by `m.key.verification.cancel`.
    CancelCode {
        /// The user cancelled or declined.
        User => "m.user",
        /// The transaction idled past its deadline.
        Timeout => "m.timeout",
        /// A message referenced a transaction we do not know.
        UnknownTransaction => "m.unknown_transaction",
        /// No mutually supported method, hash, MAC or key agreement.
        UnknownMethod => "m.unknown_method",
        /// A message arrived in a phase where it is not allowed.
        UnexpectedMessage => "m.unexpected_message",
        /// A key or key-list MAC did not verify.
        KeyMismatch => "m.key_mismatch",
        /// The sender is not the user the transaction was opened with.
        UserMismatch => "m.user_mismatch",
        /// A message was malformed.
        InvalidMessage => "m.invalid_message",
        /// Another device of the user already accepted the request.
        Accepted => "m.accepted",
        /// The humans said the short authentication strings differ.
        SasMismatch => "m.mismatched_sas",
        /// The responder's key does not match its commitment.
        CommitmentMismatch => "m.mismatched_commitment",
    }
}

/// Failure to hand a message to the transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The addressed device is unreachable.
    #[error("device {user_id}/{device_id} is unreachable")]
    Unreachable {
        /// Target user.
        user_id: String,
        /// Target device.
        device_id: String,
    },

    /// The transport refused or failed to deliver the message.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Failure inside the long-term device store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("device store error: {0}")]
pub struct StoreError(pub String);

/// Errors that can occur while driving a verification transaction.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// A message referenced a transaction we are not tracking.
    #[error("unknown transaction: {0}")]
    UnknownTransaction(String),

    /// The device that sent a request or start could not be resolved.
    #[error("unknown device {device_id} of user {user_id}")]
    UnknownDevice {
        /// Owner of the device.
        user_id: String,
        /// The device id we failed to resolve.
        device_id: String,
    },

    /// A transaction with the same (user, id) key is already live.
    #[error("transaction {0} already exists")]
    TransactionExists(String),

    /// The sender does not own the transaction it referenced.
    #[error("user {got} does not own transaction {transaction_id} (expected {expected})")]
    UserMismatch {
        /// The transaction id.
        transaction_id: String,
        /// The peer recorded on the transaction.
        expected: String,
        /// The user that sent the message.
        got: String,
    },

    /// The transaction was cancelled while handling the message.
    #[error("transaction cancelled ({code}): {reason}")]
    Cancelled {
        /// Cancel code sent to the peer.
        code: CancelCode,
        /// Human-readable reason sent to the peer.
        reason: String,
    },

    /// A cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A message could not be handed to the transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Serialization of a protocol message failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for engine operations.
pub type VerificationResult<T> = Result<T, VerificationError>;
