//! # Timeout Supervisor
//!
//! Every transaction has an idle deadline that is pushed forward by activity.
//! One timer task per transaction sleeps until the deadline and then
//! re-checks it under the transaction's own lock:
//!
//! ```text
//!   sleep_until(deadline)
//!        │
//!        ▼
//!   lock transaction ──► terminal?          ──► exit
//!                    ──► deadline moved on? ──► sleep again
//!                    ──► expired            ──► on_expire(guard)
//! ```
//!
//! Extension and the expiry check both happen under the same lock, so a
//! message that arrives just as the timer fires either extends the deadline
//! first or finds the transaction already cancelled. The task only holds a
//! weak reference and is aborted by the owner when the transaction ends.

use std::future::Future;
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// A sliding idle deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    timeout: Duration,
    expires_at: Instant,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            expires_at: Instant::now() + timeout,
        }
    }

    /// Push the deadline to `timeout` from now.
    pub fn extend(&mut self) {
        self.expires_at = Instant::now() + self.timeout;
    }

    /// When the deadline currently expires.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// The idle timeout this deadline slides by.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Something the supervisor can watch.
pub trait Supervised {
    /// Current deadline, or `None` once the transaction reached a terminal
    /// phase and no longer needs supervising.
    fn deadline(&self) -> Option<&Deadline>;
}

/// Spawn the timer task for `target`.
///
/// `on_expire` runs at most once, with the transaction lock held, only if
/// the deadline really passed and the transaction is still live.
pub fn supervise<T, F, Fut>(target: Weak<Mutex<T>>, first_wake: Instant, on_expire: F) -> AbortHandle
where
    T: Supervised + Send + 'static,
    F: FnOnce(OwnedMutexGuard<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let mut wake = first_wake;
        loop {
            sleep_until(wake).await;

            let Some(target) = target.upgrade() else {
                return;
            };
            let guard = target.lock_owned().await;
            let Some(deadline) = guard.deadline() else {
                return;
            };

            if deadline.is_expired(Instant::now()) {
                on_expire(guard).await;
                return;
            }

            wake = deadline.expires_at();
            trace!(remaining = ?(wake - Instant::now()), "deadline extended, sleeping again");
        }
    });
    task.abort_handle()
}
