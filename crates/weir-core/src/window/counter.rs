//! Single-owner sliding-window counter.

use std::fmt;
use std::hash::Hash;

use fxhash::FxHashMap;

use super::guess_cardinality;

/// A sliding window-based counter.
///
/// The main interaction with `Counter` is through [`Counter::observe`],
/// which records one observation of a value. The counter has a fixed
/// size limiting how many observations are kept: with size 10, the 11th
/// observation displaces the 1st.
///
/// `Counter` is not safe for concurrent use; all calls must come from a
/// single owner. To share one across tasks, wrap it in a
/// [`LockedCounter`](super::LockedCounter).
///
/// `T` may be any hashable value, but consider keeping it small: integers,
/// short constant strings, and small structs are fine. Heap-allocated
/// values are kept alive for as long as they sit in the window. Floats
/// have awkward equality (NaN, epsilon); prefer a fixed-point integer
/// representation.
pub struct Counter<T> {
    /// Ring of the most recent observations. `None` only during warmup.
    window: Vec<Option<T>>,
    /// Next slot to overwrite.
    head: usize,
    /// Total observations ever made.
    lifetime: u64,
    /// In-window occurrence counts. A value is present iff its count >= 1.
    current: FxHashMap<T, usize>,
    /// Fires when a value's final in-window occurrence is displaced.
    on_evict: Option<Box<dyn FnMut(T) + Send>>,
}

impl<T: fmt::Debug> fmt::Debug for Counter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("window", &self.window)
            .field("head", &self.head)
            .field("lifetime", &self.lifetime)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl<T> Counter<T>
where
    T: Hash + Eq + Clone,
{
    /// Creates a counter holding the last `size` observations, with a
    /// guessed map capacity and no eviction callback.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::build(size, 0, None)
    }

    /// Creates a counter with an explicit cardinality hint.
    ///
    /// The hint is a guess of how many distinct values the counter will
    /// ever see and sizes the internal value-to-count map. Too small and
    /// time is lost rehashing; too large and memory is wasted. Pass 0 to
    /// let the counter guess from the size of `T`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn with_capacity(size: usize, cardinality_hint: usize) -> Self {
        Self::build(size, cardinality_hint, None)
    }

    /// Creates a counter with an eviction callback.
    ///
    /// When the final in-window occurrence of a previously observed value
    /// is displaced, `on_evict` is called with that value. The callback
    /// runs inside [`Counter::observe`], in the caller's task; move any
    /// long-running work elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn with_eviction<F>(size: usize, cardinality_hint: usize, on_evict: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        Self::build(size, cardinality_hint, Some(Box::new(on_evict)))
    }

    fn build(
        size: usize,
        cardinality_hint: usize,
        on_evict: Option<Box<dyn FnMut(T) + Send>>,
    ) -> Self {
        assert!(size >= 1, "window size must be at least 1");

        let cardinality = if cardinality_hint == 0 {
            guess_cardinality::<T>()
        } else {
            cardinality_hint
        };

        let mut window = Vec::new();
        window.resize_with(size, || None);

        Self {
            window,
            head: 0,
            lifetime: 0,
            current: FxHashMap::with_capacity_and_hasher(cardinality, fxhash::FxBuildHasher::default()),
            on_evict,
        }
    }

    /// Records one observation of a value.
    ///
    /// If the window is already full, the observation made `size` calls
    /// ago is displaced first: its count is decremented and, on a 1 -> 0
    /// transition, the eviction callback runs with the displaced value
    /// in the same logical step.
    ///
    /// # Panics
    ///
    /// Panics if internal bookkeeping is inconsistent (a displaced value
    /// with no recorded count). That indicates a bug in the counter, not
    /// in the caller.
    pub fn observe(&mut self, value: T) {
        let size = self.window.len();

        if self.lifetime >= size as u64 {
            let evictee = self.window[self.head]
                .take()
                .expect("window slot vacant after warmup");

            let remaining = match self.current.get_mut(&evictee) {
                Some(count) => {
                    *count -= 1;
                    *count
                }
                None => panic!("displaced value had count 0"),
            };
            if remaining == 0 {
                self.current.remove(&evictee);
                if let Some(on_evict) = self.on_evict.as_mut() {
                    on_evict(evictee);
                }
            }
        }

        self.window[self.head] = Some(value.clone());
        self.lifetime += 1;
        self.head += 1;
        if self.head >= size {
            self.head = 0;
        }
        *self.current.entry(value).or_insert(0) += 1;
    }

    /// Returns the value's in-window count. May be 0, never larger than
    /// the window size.
    #[must_use]
    pub fn get(&self, value: &T) -> usize {
        self.current.get(value).copied().unwrap_or(0)
    }

    /// Returns a snapshot of all observed in-window values and counts.
    #[must_use]
    pub fn get_all(&self) -> FxHashMap<T, usize> {
        self.current.clone()
    }

    /// Returns the lifetime count of observations.
    #[must_use]
    pub fn lifetime(&self) -> u64 {
        self.lifetime
    }

    /// Returns the window size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.window.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    #[should_panic(expected = "window size must be at least 1")]
    fn test_zero_size_panics() {
        let _ = Counter::<u32>::new(0);
    }

    #[test]
    fn test_observe_within_warmup() {
        let mut c = Counter::new(3);
        c.observe(1);
        c.observe(2);
        c.observe(1);

        assert_eq!(c.get(&1), 2);
        assert_eq!(c.get(&2), 1);
        assert_eq!(c.get(&3), 0);
        assert_eq!(c.lifetime(), 3);
    }

    #[test]
    fn test_counts_sum_to_min_of_lifetime_and_size() {
        let mut c = Counter::new(5);
        for i in 0u64..12 {
            c.observe(i % 3);
            let total: usize = c.get_all().values().sum();
            let expected = std::cmp::min(i + 1, 5) as usize;
            assert_eq!(total, expected, "after {} observations", i + 1);
        }
    }

    #[test]
    fn test_displacement_decrements_oldest() {
        let mut c = Counter::new(2);
        c.observe("a");
        c.observe("b");
        c.observe("b");

        // "a" left the window when the third observation displaced it.
        assert_eq!(c.get(&"a"), 0);
        assert_eq!(c.get(&"b"), 2);
        assert_eq!(c.lifetime(), 3);
    }

    #[test]
    fn test_eviction_fires_once_per_transition() {
        let evicted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = evicted.clone();

        let mut c = Counter::with_eviction(2, 0, move |value: u32| {
            seen.lock().unwrap().push(value);
        });

        c.observe(7);
        c.observe(1);
        assert!(evicted.lock().unwrap().is_empty());

        // Displaces the only copy of 7.
        c.observe(2);
        assert_eq!(*evicted.lock().unwrap(), vec![7]);

        // Each further displacement retires exactly one value.
        c.observe(3);
        c.observe(4);
        assert_eq!(*evicted.lock().unwrap(), vec![7, 1, 2]);
    }

    #[test]
    fn test_no_eviction_while_still_in_window() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let seen = evictions.clone();

        let mut c = Counter::with_eviction(3, 0, move |_: u8| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        // 5 stays in the window the whole time.
        c.observe(5);
        c.observe(5);
        c.observe(5);
        c.observe(5);
        assert_eq!(evictions.load(Ordering::Relaxed), 0);
        assert_eq!(c.get(&5), 3);
    }

    #[test]
    fn test_get_all_snapshot() {
        let mut c = Counter::new(4);
        c.observe('x');
        c.observe('y');
        c.observe('x');

        let all = c.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&'x'], 2);
        assert_eq!(all[&'y'], 1);
    }
}
