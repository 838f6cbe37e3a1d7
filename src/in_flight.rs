//! The in-flight tracker and its RAII guard.
//!
//! spec.md's design notes ask a systems-language rewrite to replace the
//! sticky "panicked" wait-group flag with a type-level guarantee that
//! increments and decrements balance. [`InFlightGuard`] is that guarantee:
//! every admitted message (user or chaser) owns exactly one guard, and the
//! guard's [`Drop`] is the only code path that decrements the counter. A
//! message can only lose its guard by disposing of it explicitly
//! ([`InFlightGuard::dispose`]) when it is handed off to an equivalent
//! guard (e.g. a chaser takes over for the level it confirms).

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use tokio::sync::Notify;

struct Inner {
    count: AtomicI64,
    notify: Notify,
}

/// Tracks admitted-but-not-terminally-disposed messages across the whole
/// producer. `wait_zero` is used by shutdown to block until every admitted
/// message (including the shutdown sentinel) has been disposed of.
#[derive(Clone)]
pub struct InFlight(Arc<Inner>);

impl InFlight {
    /// Creates a new, empty tracker.
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            count: AtomicI64::new(0),
            notify: Notify::new(),
        }))
    }

    /// Admits one message, returning the guard that must travel with it
    /// until its terminal disposition.
    pub fn acquire(&self) -> InFlightGuard {
        let _ = self.0.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: self.0.clone(),
            armed: true,
        }
    }

    /// Returns the current number of admitted, undisposed messages.
    pub fn count(&self) -> i64 {
        self.0.count.load(Ordering::SeqCst)
    }

    /// Resolves once the counter reaches zero. If it is already zero,
    /// resolves immediately.
    pub async fn wait_zero(&self) {
        loop {
            if self.0.count.load(Ordering::SeqCst) <= 0 {
                return;
            }
            // Register for notification before re-checking, to avoid racing
            // a notify that fires between the check above and this await.
            let notified = self.0.notify.notified();
            if self.0.count.load(Ordering::SeqCst) <= 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard representing one admitted, not-yet-terminally-disposed
/// message. Dropping it decrements the tracker exactly once.
pub struct InFlightGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl InFlightGuard {
    /// Decrements the tracker now, rather than waiting for `Drop`. Calling
    /// this twice (directly or via `Drop`) is safe: only the first call has
    /// an effect.
    pub fn dispose(mut self) {
        self.decrement();
    }

    fn decrement(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let previous = self.inner.count.fetch_sub(1, Ordering::SeqCst);
        if previous <= 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard").field("armed", &self.armed).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn balances_across_many_guards() {
        let in_flight = InFlight::new();
        let guards: Vec<_> = (0..10).map(|_| in_flight.acquire()).collect();
        assert_eq!(in_flight.count(), 10);

        for guard in guards {
            guard.dispose();
        }
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test]
    async fn wait_zero_resolves_after_last_drop() {
        let in_flight = InFlight::new();
        let guard = in_flight.acquire();

        let waiter = in_flight.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_zero().await;
        });

        tokio::task::yield_now().await;
        drop(guard);
        handle.await.unwrap();
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test]
    async fn wait_zero_returns_immediately_when_already_zero() {
        let in_flight = InFlight::new();
        in_flight.wait_zero().await;
    }
}
