//! Counting semaphore used to await task completions across workers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A simple counting semaphore. Workers `post` on completion; the
/// coordinating thread `wait`s for one or `wait_n` completions.
#[derive(Clone, Default)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release one permit.
    pub fn post(&self) {
        let mut count = self.inner.count.lock();
        *count += 1;
        self.inner.condvar.notify_one();
    }

    /// Block until one permit is available, then consume it.
    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count == 0 {
            self.inner.condvar.wait(&mut count);
        }
        *count -= 1;
    }

    /// Block until `n` permits have been consumed. Returns `n`.
    pub fn wait_n(&self, n: usize) -> usize {
        for _ in 0..n {
            self.wait();
        }
        n
    }

    /// Wait for one permit with a timeout. Returns `false` on expiry.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.inner.count.lock();
        while *count == 0 {
            if self
                .inner
                .condvar
                .wait_until(&mut count, deadline)
                .timed_out()
            {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new();
        sem.post();
        sem.wait();
    }

    #[test]
    fn test_wait_n_across_threads() {
        let sem = Semaphore::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = sem.clone();
                std::thread::spawn(move || s.post())
            })
            .collect();
        assert_eq!(sem.wait_n(4), 4);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_wait_for_times_out() {
        let sem = Semaphore::new();
        assert!(!sem.wait_for(Duration::from_millis(10)));
        sem.post();
        assert!(sem.wait_for(Duration::from_millis(10)));
    }
}
