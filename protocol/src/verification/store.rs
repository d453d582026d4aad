//! # Transaction Store
//!
//! Concurrent map from `(peer user, transaction id)` to the live transaction.
//! Each slot owns its own async mutex; the map itself is only ever locked for
//! the duration of a single shard operation, never across an `.await`.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::message::{TransactionId, UserId};
use super::transaction::VerificationTransaction;

/// Store key: transaction ids are only unique per peer user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    /// The peer user the transaction is with.
    pub user_id: UserId,
    /// The transaction id.
    pub transaction_id: TransactionId,
}

impl TransactionKey {
    /// Build a key from its parts.
    pub fn new(user_id: impl Into<UserId>, transaction_id: impl Into<TransactionId>) -> Self {
        Self {
            user_id: user_id.into(),
            transaction_id: transaction_id.into(),
        }
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.transaction_id)
    }
}

/// Shared handle to one transaction.
pub type Handle<T> = Arc<Mutex<T>>;

/// The live transactions of one engine.
pub struct TransactionStore<T = VerificationTransaction> {
    entries: DashMap<TransactionKey, Handle<T>>,
}

impl<T> TransactionStore<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the transaction under `key`, creating it with `make` if absent.
    ///
    /// The boolean is `true` when the transaction already existed; `make` is
    /// not called in that case. Of any number of concurrent callers for the
    /// same key exactly one observes `false`.
    pub fn load_or_create(&self, key: TransactionKey, make: impl FnOnce() -> T) -> (Handle<T>, bool) {
        match self.entries.entry(key) {
            Entry::Occupied(slot) => (Arc::clone(slot.get()), true),
            Entry::Vacant(slot) => {
                let handle = Arc::new(Mutex::new(make()));
                slot.insert(Arc::clone(&handle));
                (handle, false)
            }
        }
    }

    /// Look up the transaction under `key`.
    pub fn load(&self, key: &TransactionKey) -> Option<Handle<T>> {
        self.entries.get(key).map(|slot| Arc::clone(slot.value()))
    }

    /// Remove `key` if it still maps to `handle`.
    ///
    /// A holder of a stale handle can never remove a newer transaction that
    /// reused the key.
    pub fn delete(&self, key: &TransactionKey, handle: &Handle<T>) -> bool {
        self.entries
            .remove_if(key, |_, stored| Arc::ptr_eq(stored, handle))
            .is_some()
    }

    /// Snapshot of the current keys.
    pub fn keys(&self) -> Vec<TransactionKey> {
        self.entries.iter().map(|slot| slot.key().clone()).collect()
    }

    /// Number of live transactions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no transaction is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for TransactionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
