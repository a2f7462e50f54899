//! Lazy keyed dispatch.
//!
//! A [`Lazy`] dispatcher routes items to a per-key [`Acceptor`],
//! constructing acceptors on demand through a factory and closing them
//! again once their key has been idle for a window of recent
//! observations. It is the "route by key, build on first use, tear down
//! when cold" pattern the grouping batcher uses, exposed as a reusable
//! piece for acceptors of any shape (writers, caches, connections).
//!
//! Unlike the grouping batcher, acceptors are driven directly on the
//! caller's task, so [`Lazy::accept`] may be called from many tasks at
//! once. Per-entry reference counts keep an acceptor alive while any
//! caller is still using it, even if its key just slid out of the
//! window.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::dag::BoxError;
use crate::window::{Counter, LockedCounter};

/// Window size used when the caller passes 0.
const DEFAULT_WINDOW: usize = 100;

/// Items a [`Lazy`] dispatcher accepts. `key` should be a pure function:
/// the same item always yields the same key, regardless of state.
pub trait Keyed {
    /// Returns the routing key for this item.
    fn key(&self) -> String;
}

/// Destination for dispatched items.
#[async_trait]
pub trait Acceptor<T>: Send + Sync {
    /// Accepts one item.
    ///
    /// # Errors
    ///
    /// Implementation-defined; surfaced to the caller of
    /// [`Lazy::accept`] unchanged.
    async fn accept(&self, item: T) -> Result<(), BoxError>;

    /// Called when the acceptor is no longer required.
    async fn close(&self);
}

/// Errors surfaced by [`Lazy::accept`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The item's `key` implementation panicked.
    #[error("keyer panicked: {0}")]
    KeyerPanicked(String),

    /// The acceptor factory panicked.
    #[error("factory panicked: {0}")]
    FactoryPanicked(String),

    /// The acceptor factory returned an error.
    #[error("factory: {0}")]
    Factory(#[source] BoxError),

    /// The acceptor rejected the item.
    #[error(transparent)]
    Acceptor(BoxError),
}

/// Builds the acceptor for a key. May be called from multiple tasks at
/// once, and the dispatcher may construct and immediately close an
/// acceptor that lost a creation race.
pub type Factory<T> = Box<dyn Fn(&str) -> Result<Box<dyn Acceptor<T>>, BoxError> + Send + Sync>;

struct Entry<T> {
    acceptor: Box<dyn Acceptor<T>>,
    /// Incremented while retrieving the entry under the map lock,
    /// decremented after use. Cleanup only removes entries it observes
    /// at 0 under the exclusive lock, so it cannot race a live user.
    ref_count: AtomicI64,
}

struct LazyInner<T> {
    /// `None` once the dispatcher is closed.
    active: RwLock<Option<FxHashMap<String, Arc<Entry<T>>>>>,
    /// Observes keys; its eviction callback drives cleanup. Holds only
    /// keys, not items, so dispatched items are not kept alive.
    window: LockedCounter<String>,
    factory: Factory<T>,
}

/// A lazy dispatcher. See the [module docs](self).
pub struct Lazy<T> {
    inner: Arc<LazyInner<T>>,
}

impl<T> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = self.inner.active.read().is_some();
        f.debug_struct("Lazy").field("open", &open).finish()
    }
}

impl<T> Lazy<T>
where
    T: Keyed + Send + 'static,
{
    /// Creates a lazy dispatcher.
    ///
    /// Once a key has been idle for `window_size` accepted items, its
    /// acceptor is closed and removed; the next item for that key builds
    /// a fresh one. Pass 0 for a default window. `key_cardinality` is a
    /// sizing hint for the internal maps and may be 0.
    #[must_use]
    pub fn new(factory: Factory<T>, window_size: usize, key_cardinality: usize) -> Self {
        let window_size = if window_size < 1 {
            DEFAULT_WINDOW
        } else {
            window_size
        };

        let inner = Arc::new_cyclic(|weak: &Weak<LazyInner<T>>| {
            let cleanup_ref = weak.clone();
            let counter = Counter::with_eviction(window_size, key_cardinality, move |key: String| {
                if let Some(inner) = cleanup_ref.upgrade() {
                    cleanup(&inner, &key);
                }
            });

            LazyInner {
                active: RwLock::new(Some(FxHashMap::default())),
                window: LockedCounter::new(counter),
                factory,
            }
        });

        Self { inner }
    }

    /// Accepts a keyed item for dispatching.
    ///
    /// # Errors
    ///
    /// Returns any error from the factory or the acceptor. Panics in the
    /// keyer or the factory are caught at the callback boundary and
    /// converted to errors.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Lazy::close`].
    pub async fn accept(&self, item: T) -> Result<(), DispatchError> {
        let key = catch_panic(|| item.key()).map_err(DispatchError::KeyerPanicked)?;

        // Fast path: the acceptor exists. The refcount increment happens
        // under the shared lock, so cleanup (which takes the exclusive
        // lock before reading the count) cannot observe 0 while this
        // caller holds the entry.
        let mut entry = {
            let guard = self.inner.active.read();
            let map = guard.as_ref().expect("dispatcher closed");
            map.get(&key).map(|entry| {
                entry.ref_count.fetch_add(1, Ordering::AcqRel);
                entry.clone()
            })
        };

        if entry.is_none() {
            // Build outside any lock; the factory may be slow.
            let acceptor = self.new_acceptor(&key)?;

            let (winner, redundant) = {
                let mut guard = self.inner.active.write();
                let map = guard.as_mut().expect("dispatcher closed");
                match map.get(&key) {
                    Some(existing) => {
                        // Lost a creation race.
                        existing.ref_count.fetch_add(1, Ordering::AcqRel);
                        (existing.clone(), Some(acceptor))
                    }
                    None => {
                        let fresh = Arc::new(Entry {
                            acceptor,
                            ref_count: AtomicI64::new(1),
                        });
                        map.insert(key.clone(), fresh.clone());
                        (fresh, None)
                    }
                }
            };

            if let Some(redundant) = redundant {
                redundant.close().await;
            }
            entry = Some(winner);
        }

        let entry = entry.expect("entry resolved above");

        // The observation may evict some other cold key inline.
        self.inner.window.observe(key.clone());

        let result = entry.acceptor.accept(item).await;

        let remaining = entry.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(remaining >= 0, "refcount after use < 0, key={key:?}");

        result.map_err(DispatchError::Acceptor)
    }

    /// Closes the dispatcher and every live acceptor. `accept` must not
    /// be called afterwards.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub async fn close(&self) {
        let entries = {
            let mut guard = self.inner.active.write();
            guard.take().expect("dispatcher closed twice")
        };

        for entry in entries.into_values() {
            entry.acceptor.close().await;
        }
    }

    fn new_acceptor(&self, key: &str) -> Result<Box<dyn Acceptor<T>>, DispatchError> {
        catch_panic(|| (self.inner.factory)(key))
            .map_err(DispatchError::FactoryPanicked)?
            .map_err(DispatchError::Factory)
    }
}

/// Window eviction callback: closes and removes a cold key's acceptor,
/// unless a concurrent caller has it checked out. Runs inline in
/// whichever `accept` call made the displacing observation.
fn cleanup<T>(inner: &LazyInner<T>, key: &str)
where
    T: Send + 'static,
{
    let entry = {
        let mut guard = inner.active.write();
        let Some(map) = guard.as_mut() else {
            // Dispatcher closed while the observation was in flight.
            return;
        };

        let entry = map.get(key).expect("evicted key already removed");
        let ref_count = entry.ref_count.load(Ordering::Acquire);
        if ref_count > 0 {
            // The key already left the window, but another caller holds
            // the acceptor. That caller's own observation puts the key
            // back in the window, so the entry must stay.
            return;
        }
        assert!(ref_count == 0, "refcount at cleanup < 0, key={key:?}");

        map.remove(key).expect("entry vanished under write lock")
    };

    // Close off the caller's lock path; acceptors may take their time.
    tokio::spawn(async move {
        entry.acceptor.close().await;
    });
}

/// Runs a callback, converting a panic into an error message.
fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(panic) => Err(panic_message(&panic)),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
