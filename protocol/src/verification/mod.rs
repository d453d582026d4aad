//! # Interactive Device Verification
//!
//! The SAS handshake lets two devices confirm that the long-term signing
//! key each one holds for the other is authentic. Both sides derive a short
//! authentication string from an ephemeral X25519 agreement, the humans
//! compare it out-of-band, and each side then MACs its own signing key with
//! the shared secret. A device is marked verified only when the local human
//! said "they match" *and* the peer's MAC checks out.
//!
//! ## Components
//!
//! - [`mac`]: Commitment and MAC calculation over canonical byte strings.
//! - [`methods`]: SAS code derivation (decimal, emoji) and negotiation.
//! - [`store`]: Concurrent `(user, transaction id)` → transaction map.
//! - [`timeout`]: One idle timer per transaction, extended by activity.
//! - [`transaction`]: Per-transaction state and the phase machine.
//! - [`engine`]: The dispatcher that ties it all together.
//! - [`hooks`]: The traits the host application and collaborators implement.
//! - [`memory`]: In-process transport and device store.
//!
//! ## Concurrency
//!
//! Every transaction sits behind its own async mutex. Messages for one
//! transaction are applied strictly in receipt order; messages for different
//! transactions never contend. The human comparison runs in its own task and
//! never holds a transaction lock.

/// Declares a string-valued wire identifier with known variants plus an
/// `Other` catch-all that keeps unknown values verbatim.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// A value this implementation does not know, kept verbatim.
            Other(String),
        }

        impl $name {
            /// The identifier as it appears on the wire.
            pub fn as_str(&self) -> &str {
                match self {
                    $( Self::$variant => $wire, )+
                    Self::Other(other) => other.as_str(),
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $( if value == $wire { return Self::$variant; } )+
                Self::Other(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::from(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub mod engine;
pub mod error;
pub mod hooks;
pub mod mac;
pub mod memory;
pub mod message;
pub mod methods;
pub mod store;
pub mod timeout;
pub mod transaction;

pub use engine::{OwnDevice, VerificationEngine};
pub use error::{CancelCode, StoreError, TransportError, VerificationError, VerificationResult};
pub use hooks::{AcceptDecision, DeviceStore, Transport, VerificationHandler, VerificationHooks};
pub use memory::{Envelope, Interceptor, MemoryDeviceStore, MemoryNetwork, MemoryTransport};
pub use message::{
    AcceptContent, CancelContent, DeviceId, DeviceIdentity, HashMethod, KeyAgreementProtocol,
    KeyContent, MacContent, MacMethod, RequestContent, SasMethod, StartContent, TransactionId,
    UserId, VerificationMessage, VerificationMethod,
};
pub use methods::{Emoji, SasCode, EMOJI_TABLE};
pub use store::{TransactionKey, TransactionStore};
pub use transaction::Phase;
