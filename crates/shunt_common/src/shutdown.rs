//! Interruptible shutdown signal.
//!
//! Condvar-backed so that threads parked in a timed wait wake within
//! microseconds of the request instead of sleeping out their interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A cooperative shutdown signal shared between the control plane and
/// background threads.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    requested: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown, waking every parked waiter immediately.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Whether shutdown has been requested.
    pub fn requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Park for at most `timeout`, returning early if shutdown is
    /// requested. Returns `true` when the caller should exit.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.requested() {
            return true;
        }
        let mut guard = self.inner.mutex.lock();
        let _ = self.inner.condvar.wait_for(&mut guard, timeout);
        self.requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_starts_clear() {
        assert!(!ShutdownSignal::new().requested());
    }

    #[test]
    fn test_request_is_sticky() {
        let sig = ShutdownSignal::new();
        sig.request();
        assert!(sig.requested());
        assert!(sig.wait_for(Duration::from_secs(10)));
    }

    #[test]
    fn test_wait_wakes_on_request() {
        let sig = ShutdownSignal::new();
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let exited = sig2.wait_for(Duration::from_secs(10));
            (exited, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.request();
        let (exited, elapsed) = handle.join().unwrap();
        assert!(exited);
        assert!(elapsed < Duration::from_secs(1), "woke after {elapsed:?}");
    }

    #[test]
    fn test_wait_expires_without_request() {
        let sig = ShutdownSignal::new();
        assert!(!sig.wait_for(Duration::from_millis(20)));
    }
}
