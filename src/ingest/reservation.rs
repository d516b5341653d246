//! Shared memory budget for buffered messages.
//!
//! Buffering a decoded message requires reserving its exact serialized
//! byte size from a [`ReservationManager`]. When the budget is exhausted,
//! [`ReservationManager::reserve`] cooperatively suspends the caller until
//! capacity returns. This is the sole ingestion backpressure mechanism —
//! there is no separate queue-depth limit.
//!
//! The returned [`ReservationHandle`] releases its bytes exactly once, on
//! drop, covering every exit path of the owning event.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct Inner {
    budget: u64,
    available: Mutex<u64>,
    notify: Notify,
}

/// Shared byte budget. Cheap to clone; clones share the same budget.
#[derive(Debug, Clone)]
pub struct ReservationManager {
    inner: Arc<Inner>,
}

impl ReservationManager {
    /// Creates a manager with the given budget in bytes.
    #[must_use]
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                budget: budget_bytes,
                available: Mutex::new(budget_bytes),
                notify: Notify::new(),
            }),
        }
    }

    /// The configured budget.
    #[must_use]
    pub fn budget(&self) -> u64 {
        self.inner.budget
    }

    /// Bytes currently available for reservation.
    #[must_use]
    pub fn available(&self) -> u64 {
        *self.inner.available.lock()
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn reserved(&self) -> u64 {
        self.inner.budget - self.available()
    }

    /// Reserves immediately if capacity allows; never suspends.
    #[must_use]
    pub fn try_reserve(&self, bytes: u64) -> Option<ReservationHandle> {
        let request = self.clamp(bytes);
        let mut available = self.inner.available.lock();
        if *available >= request {
            *available -= request;
            Some(ReservationHandle {
                inner: Arc::clone(&self.inner),
                bytes: request,
                released: false,
            })
        } else {
            None
        }
    }

    /// Reserves `bytes`, suspending until capacity is available.
    ///
    /// A request larger than the whole budget is clamped to the budget —
    /// it could otherwise never be granted — and logged.
    pub async fn reserve(&self, bytes: u64) -> ReservationHandle {
        let request = self.clamp(bytes);
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register for wakeups before checking, so a release between
            // the check and the await is never lost.
            notified.as_mut().enable();
            if let Some(handle) = self.try_reserve(request) {
                return handle;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }

    fn clamp(&self, bytes: u64) -> u64 {
        if bytes > self.inner.budget {
            tracing::warn!(
                requested = bytes,
                budget = self.inner.budget,
                "reservation larger than whole budget, clamping"
            );
            self.inner.budget
        } else {
            bytes
        }
    }
}

/// Ties a buffered message to its reserved bytes.
///
/// Releases exactly once: on drop, or earlier via
/// [`ReservationHandle::release`].
#[derive(Debug)]
pub struct ReservationHandle {
    inner: Arc<Inner>,
    bytes: u64,
    released: bool,
}

impl ReservationHandle {
    /// Size of this reservation in bytes (after clamping).
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Releases the reservation now, consuming the handle.
    pub fn release(self) {
        // Drop does the work.
        drop(self);
    }
}

impl Drop for ReservationHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut available = self.inner.available.lock();
            *available = (*available + self.bytes).min(self.inner.budget);
        }
        // Wake every waiter: the smallest pending request may not be the
        // longest-waiting one.
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_accounting_balances() {
        let manager = ReservationManager::new(100);
        assert_eq!(manager.available(), 100);

        let a = manager.reserve(40).await;
        let b = manager.reserve(60).await;
        assert_eq!(manager.available(), 0);
        assert_eq!(manager.reserved(), 100);

        drop(a);
        assert_eq!(manager.available(), 40);
        b.release();
        assert_eq!(manager.available(), 100);
        assert_eq!(manager.reserved(), 0);
    }

    #[tokio::test]
    async fn test_reserve_suspends_until_release() {
        let manager = ReservationManager::new(10);
        let held = manager.reserve(10).await;

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let handle = manager.reserve(5).await;
                handle.bytes()
            })
        };

        // The waiter cannot proceed while the budget is exhausted.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after release")
            .unwrap();
        assert_eq!(got, 5);
        assert_eq!(manager.available(), 5);
    }

    #[tokio::test]
    async fn test_oversized_request_is_clamped() {
        let manager = ReservationManager::new(10);
        let handle = manager.reserve(1_000_000).await;
        assert_eq!(handle.bytes(), 10);
        assert_eq!(manager.available(), 0);
        drop(handle);
        assert_eq!(manager.available(), 10);
    }

    #[tokio::test]
    async fn test_try_reserve_never_suspends() {
        let manager = ReservationManager::new(10);
        let held = manager.try_reserve(8).expect("capacity available");
        assert!(manager.try_reserve(5).is_none());
        drop(held);
        assert!(manager.try_reserve(5).is_some());
    }

    #[tokio::test]
    async fn test_multiple_waiters_all_wake_eventually() {
        let manager = ReservationManager::new(10);
        let held = manager.reserve(10).await;

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            waiters.push(tokio::spawn(async move {
                let handle = manager.reserve(2).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(handle);
            }));
        }

        drop(held);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .expect("every waiter should complete")
                .unwrap();
        }
        assert_eq!(manager.available(), 10);
    }
}
