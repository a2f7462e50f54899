//! Mutex-wrapped sliding-window counter.

use std::hash::Hash;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::Counter;

/// A [`Counter`] wrapper that takes a lock around every call, for use
/// from many producers.
///
/// All the single-owner invariants carry over; in particular the
/// eviction callback still runs inside [`LockedCounter::observe`], now
/// under the lock. The callback must not call back into the counter.
///
/// When sharing a counter widely, pass a generous cardinality hint to
/// [`Counter::with_capacity`] so less time is spent resizing the map
/// while the lock is held.
#[derive(Debug)]
pub struct LockedCounter<T> {
    inner: Mutex<Counter<T>>,
}

impl<T> LockedCounter<T>
where
    T: Hash + Eq + Clone,
{
    /// Wraps a [`Counter`], making it thread-safe. The counter moves in;
    /// there is no way to reach it except through the lock.
    #[must_use]
    pub fn new(counter: Counter<T>) -> Self {
        Self {
            inner: Mutex::new(counter),
        }
    }

    /// Records one observation of a value. See [`Counter::observe`].
    pub fn observe(&self, value: T) {
        self.inner.lock().observe(value);
    }

    /// Returns the value's in-window count. See [`Counter::get`].
    #[must_use]
    pub fn get(&self, value: &T) -> usize {
        self.inner.lock().get(value)
    }

    /// Returns a snapshot of all in-window values and counts.
    #[must_use]
    pub fn get_all(&self) -> FxHashMap<T, usize> {
        self.inner.lock().get_all()
    }

    /// Returns the lifetime count of observations.
    #[must_use]
    pub fn lifetime(&self) -> u64 {
        self.inner.lock().lifetime()
    }

    /// Returns the window size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_shared_across_threads() {
        let counter = Arc::new(LockedCounter::new(Counter::with_capacity(64, 16)));

        let mut handles = Vec::new();
        for t in 0u64..4 {
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..16 {
                    counter.observe(t);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.lifetime(), 64);
        let total: usize = counter.get_all().values().sum();
        assert_eq!(total, 64);
        for t in 0u64..4 {
            assert_eq!(counter.get(&t), 16);
        }
    }

    #[test]
    fn test_eviction_under_lock() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let seen = evictions.clone();

        let counter = LockedCounter::new(Counter::with_eviction(2, 0, move |_: u32| {
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        counter.observe(1);
        counter.observe(2);
        counter.observe(3);
        counter.observe(4);

        // 1 and 2 each left the window exactly once.
        assert_eq!(evictions.load(Ordering::Relaxed), 2);
        assert_eq!(counter.get(&3), 1);
        assert_eq!(counter.get(&4), 1);
    }
}
