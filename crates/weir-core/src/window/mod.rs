//! Sliding-window counters.
//!
//! A [`Counter`] counts how many times each value was observed within the
//! last `N` observations. When the final in-window occurrence of a value
//! is displaced by a newer observation, an eviction callback fires with
//! that value. This is the primitive behind idle detection: "evict the
//! sub-batcher for a key once `N` consecutive observations went to other
//! keys".
//!
//! Two variants share the same contract:
//! - [`Counter`] requires the caller to serialize all calls
//! - [`LockedCounter`] wraps a [`Counter`] in a mutex for use from many
//!   producers
//!
//! # Invariants
//!
//! - The sum of all counts equals `min(lifetime, size)`
//! - A value is present in [`Counter::get_all`] iff its count is >= 1
//! - The eviction callback fires exactly once per 1 -> 0 count transition

mod counter;
mod locked;

pub use counter::Counter;
pub use locked::LockedCounter;

/// Picks a default capacity for the value-to-count map from the size of
/// the value type. Small values tend to have small cardinality (flags,
/// small enums, short keys); large or indirect values (strings, fat
/// structs) can be effectively unbounded.
pub(crate) fn guess_cardinality<T>() -> usize {
    match std::mem::size_of::<T>() {
        0..=4 => 256,
        5..=8 => 1024,
        9..=16 => 2048,
        _ => 4096,
    }
}
