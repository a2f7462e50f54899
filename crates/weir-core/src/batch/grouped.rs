//! Grouping batcher: per-key sub-batchers with idle eviction.

use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::timed::{batch, BatchConfig};
use crate::window::Counter;

/// Fallback capacity for the per-key record map when neither a lifetime
/// nor a cardinality hint is given. Just a guess.
const DEFAULT_KEY_CARDINALITY: usize = 100;

/// Capacity policy for the channels feeding each sub-batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubCapacity {
    /// The lesser of the input channel's capacity and the batching
    /// threshold, clamped to at least 1.
    #[default]
    Inferred,

    /// The smallest channel the runtime supports (capacity 1), the
    /// closest available analogue of a rendezvous handoff.
    Minimal,

    /// An explicit capacity.
    Fixed(usize),
}

impl SubCapacity {
    fn resolve<T>(self, input: &mpsc::Receiver<T>, threshold: usize) -> usize {
        match self {
            Self::Inferred => input.max_capacity().min(threshold).max(1),
            Self::Minimal => 1,
            Self::Fixed(capacity) => {
                assert!(capacity >= 1, "fixed sub-channel capacity must be at least 1");
                capacity
            }
        }
    }
}

/// Configuration for a grouping batcher.
#[derive(Debug, Clone)]
pub struct GroupedConfig {
    /// Batching behaviour of each sub-batcher.
    pub batch: BatchConfig,

    /// Capacity of the channels created as sub-batcher inputs.
    pub sub_capacity: SubCapacity,

    /// The number of observed items that do not match some key before the
    /// idle sub-batcher for that key is stopped.
    ///
    /// With a lifetime of 10, once an item with key `A` arrives, the
    /// sub-batcher for `A` survives until 10 consecutive items carry
    /// other keys.
    ///
    /// 0 disables eviction entirely: sub-batchers live until shutdown,
    /// which can cost memory when the key cardinality is high.
    pub lifetime: usize,

    /// A hint of the key cardinality, used to size internal maps. May be
    /// 0, in which case a default is inferred from the key type.
    pub cardinality_hint: usize,
}

impl GroupedConfig {
    /// Creates a configuration with inferred sub-channel capacity and
    /// eviction disabled.
    #[must_use]
    pub fn new(batch: BatchConfig) -> Self {
        Self {
            batch,
            sub_capacity: SubCapacity::Inferred,
            lifetime: 0,
            cardinality_hint: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-key records
// ---------------------------------------------------------------------------

/// Record lifecycle: accepting items.
const RUNNING: u8 = 0;
/// Record lifecycle: input closed, sub-batcher draining.
const CLOSING: u8 = 1;
/// Record lifecycle: removed from the active map.
const DELETED: u8 = 2;

/// Bookkeeping for one live sub-batcher.
struct SubRecord<T> {
    /// Input to the sub-batcher. Taking the sender closes it.
    input: Mutex<Option<mpsc::Sender<T>>>,
    /// Lifecycle phase, readable without the map lock.
    state: AtomicU8,
    /// Flips to true as the sub-batcher task exits.
    exited: watch::Receiver<bool>,
}

/// An evicted record on its way to the cleanup worker.
struct Evicted<T, K> {
    key: K,
    record: Arc<SubRecord<T>>,
}

type ActiveMap<T, K> = Arc<Mutex<FxHashMap<K, Arc<SubRecord<T>>>>>;

// ---------------------------------------------------------------------------
// Grouping batcher
// ---------------------------------------------------------------------------

/// Spawns [`batch_grouped`] onto the runtime and returns its handle.
pub fn spawn_batch_grouped<T, K, F>(
    input: mpsc::Receiver<T>,
    output: mpsc::Sender<Vec<T>>,
    keyer: F,
    config: GroupedConfig,
) -> JoinHandle<()>
where
    T: Send + 'static,
    K: Hash + Eq + Clone + Send + 'static,
    F: Fn(&T) -> K + Send + 'static,
{
    tokio::spawn(batch_grouped(input, output, keyer, config))
}

/// Batches items from `input` into per-key batches on `output`.
///
/// Every received item has a group determined by the `keyer` function,
/// and is routed to a dedicated sub-batcher (see
/// [`batch`](super::batch)) for that group; the sub-batcher outputs are
/// multiplexed onto the shared `output`. The pump exits, along with all
/// sub-batchers, after `input` closes, flushing everything in flight and
/// then closing `output`.
///
/// Guarantees:
/// - no batch mixes keys
/// - a batch is never empty
/// - items with the same key appear in output batches in input order,
///   even across eviction and replacement of that key's sub-batcher
///
/// `keyer` must be pure: the same item always yields the same key.
/// A non-pure keyer leaves the per-key order undefined.
///
/// # Panics
///
/// Panics if the embedded [`BatchConfig`] is invalid, if a fixed
/// sub-channel capacity is 0, or on internal lifecycle violations (which
/// are bugs in the batcher, not the caller).
pub async fn batch_grouped<T, K, F>(
    mut input: mpsc::Receiver<T>,
    output: mpsc::Sender<Vec<T>>,
    keyer: F,
    config: GroupedConfig,
) where
    T: Send + 'static,
    K: Hash + Eq + Clone + Send + 'static,
    F: Fn(&T) -> K + Send,
{
    config.batch.assert_valid();
    let sub_capacity = config.sub_capacity.resolve(&input, config.batch.threshold);

    let map_capacity = if config.lifetime > 0 {
        config.lifetime
    } else if config.cardinality_hint > 0 {
        config.cardinality_hint
    } else {
        DEFAULT_KEY_CARDINALITY
    };
    let active: ActiveMap<T, K> = Arc::new(Mutex::new(FxHashMap::with_capacity_and_hasher(
        map_capacity,
        fxhash::FxBuildHasher::default(),
    )));

    // The window drives eviction; the queue connects it to the cleanup
    // worker. With lifetime 0 neither exists and records are only
    // removed at shutdown.
    let (window, cleanup_task) = if config.lifetime > 0 {
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let window = Counter::with_eviction(config.lifetime, config.cardinality_hint, {
            let active = active.clone();
            move |key: K| evict(&active, &evict_tx, key)
        });
        let cleanup_task = tokio::spawn(cleanup(active.clone(), evict_rx));
        (Some(window), Some(cleanup_task))
    } else {
        (None, None)
    };

    let mut grouped = Grouped {
        active,
        output,
        sub_config: config.batch,
        sub_capacity,
        keyer,
        window,
        sub_tasks: Vec::new(),
    };

    while let Some(item) = input.recv().await {
        grouped.accept_one(item).await;
    }

    // Shut down sub-batchers in any order.
    for record in grouped.active.lock().values() {
        record.input.lock().take();
    }

    // Dropping the window drops the eviction sender, which closes the
    // cleanup queue once queued evictions drain.
    grouped.window.take();

    // Once every sub-batcher has flushed and exited, the output can
    // close on their behalf (by dropping the last senders on return).
    for task in grouped.sub_tasks.drain(..) {
        let _ = task.await;
    }
    if let Some(task) = cleanup_task {
        let _ = task.await;
    }
}

struct Grouped<T, K, F> {
    active: ActiveMap<T, K>,
    output: mpsc::Sender<Vec<T>>,
    sub_config: BatchConfig,
    sub_capacity: usize,
    keyer: F,
    window: Option<Counter<K>>,
    sub_tasks: Vec<JoinHandle<()>>,
}

impl<T, K, F> Grouped<T, K, F>
where
    T: Send + 'static,
    K: Hash + Eq + Clone + Send + 'static,
    F: Fn(&T) -> K + Send,
{
    async fn accept_one(&mut self, item: T) {
        let key = (self.keyer)(&item);

        let existing = self.active.lock().get(&key).cloned();

        // A Closing record was evicted by the window on an earlier item.
        // Its replacement may not be published until the old record is
        // fully deleted, or same-key order could break across the two.
        let (record, old) = match existing {
            Some(record) if record.state.load(Ordering::Acquire) == RUNNING => {
                (Some(record), None)
            }
            Some(record) => (None, Some(record)),
            None => (None, None),
        };

        let record = match record {
            Some(record) => record,
            None => self.create_sub(key.clone(), old).await,
        };

        let sender = record
            .input
            .lock()
            .clone()
            .expect("running sub-batcher has no input sender");
        let _ = sender.send(item).await;

        // May trigger eviction of whichever key now leaves the window.
        if let Some(window) = self.window.as_mut() {
            window.observe(key);
        }
    }

    async fn create_sub(&mut self, key: K, old: Option<Arc<SubRecord<T>>>) -> Arc<SubRecord<T>> {
        tracing::debug!(
            lifetime = self.window.as_ref().map_or(0, Counter::lifetime),
            "creating sub-batcher"
        );

        let (sub_tx, sub_rx) = mpsc::channel(self.sub_capacity);
        let (exit_tx, exit_rx) = watch::channel(false);
        let record = Arc::new(SubRecord {
            input: Mutex::new(Some(sub_tx)),
            state: AtomicU8::new(RUNNING),
            exited: exit_rx,
        });

        let output = self.output.clone();
        let sub_config = self.sub_config.clone();
        self.sub_tasks.push(tokio::spawn(async move {
            batch(sub_rx, output, sub_config).await;
            let _ = exit_tx.send(true);
        }));

        if let Some(old) = old {
            // The evicted predecessor first drains, then cleanup deletes
            // it. Only then may the replacement be published.
            let mut exited = old.exited.clone();
            let _ = exited.wait_for(|done| *done).await;
            while old.state.load(Ordering::Acquire) != DELETED {
                // Cleanup is about to finish; the map lock is free.
                tokio::task::yield_now().await;
            }
        }

        self.active.lock().insert(key, record.clone());
        record
    }
}

/// Window eviction callback: transitions the record out of the active
/// phase and hands it to the cleanup worker. Runs synchronously inside
/// the accept path's `observe` call.
fn evict<T, K>(
    active: &Mutex<FxHashMap<K, Arc<SubRecord<T>>>>,
    evict_tx: &mpsc::UnboundedSender<Evicted<T, K>>,
    key: K,
) where
    K: Hash + Eq,
{
    let record = active
        .lock()
        .get(&key)
        .cloned()
        .expect("evicted key has no live sub-batcher");

    let swapped = record
        .state
        .compare_exchange(RUNNING, CLOSING, Ordering::AcqRel, Ordering::Acquire);
    assert!(swapped.is_ok(), "evicted sub-batcher was not running");

    // Closing the input makes the sub-batcher flush and exit.
    record.input.lock().take();
    tracing::debug!("sub-batcher idle, closing");

    let _ = evict_tx.send(Evicted { key, record });
}

/// Cleanup worker: retires evicted records once their sub-batchers have
/// drained, unblocking replacement creation for the same key.
async fn cleanup<T, K>(active: ActiveMap<T, K>, mut evictq: mpsc::UnboundedReceiver<Evicted<T, K>>)
where
    T: Send,
    K: Hash + Eq,
{
    while let Some(Evicted { key, record }) = evictq.recv().await {
        let mut exited = record.exited.clone();
        let _ = exited.wait_for(|done| *done).await;

        {
            let mut map = active.lock();
            let current = map
                .get(&key)
                .expect("cleanup found no record for evicted key");
            assert!(
                Arc::ptr_eq(current, &record),
                "cleanup found a foreign record for evicted key"
            );
            map.remove(&key);
        }

        let swapped = record
            .state
            .compare_exchange(CLOSING, DELETED, Ordering::AcqRel, Ordering::Acquire);
        assert!(swapped.is_ok(), "retired sub-batcher was not closing");
        tracing::debug!("sub-batcher record deleted");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
