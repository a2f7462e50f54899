//! Size/time bounded batching pump.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Configuration for a batcher.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum items per emitted batch.
    pub threshold: usize,
    /// Maximum time a non-empty batch waits before being emitted.
    pub interval: Duration,
    /// Whether to allocate each batch with `threshold` capacity up front.
    /// Worth it when the size trigger usually wins; wasteful when the
    /// time trigger usually wins with small batches.
    pub preallocate: bool,
}

impl BatchConfig {
    /// Creates a configuration with preallocation disabled.
    #[must_use]
    pub fn new(threshold: usize, interval: Duration) -> Self {
        Self {
            threshold,
            interval,
            preallocate: false,
        }
    }

    /// Asserts the configuration is usable.
    ///
    /// # Panics
    ///
    /// Panics if `threshold` is 0 or `interval` is zero. Both are caller
    /// bugs, not runtime conditions.
    pub(crate) fn assert_valid(&self) {
        assert!(self.threshold >= 1, "batch threshold must be at least 1");
        assert!(!self.interval.is_zero(), "batch interval must be non-zero");
    }

    fn new_batch<T>(&self, first: T) -> Vec<T> {
        let mut batch = if self.preallocate {
            Vec::with_capacity(self.threshold)
        } else {
            Vec::with_capacity(1)
        };
        batch.push(first);
        batch
    }
}

/// Spawns [`batch`] onto the runtime and returns its handle.
pub fn spawn_batch<T>(
    input: mpsc::Receiver<T>,
    output: mpsc::Sender<Vec<T>>,
    config: BatchConfig,
) -> JoinHandle<()>
where
    T: Send + 'static,
{
    tokio::spawn(batch(input, output, config))
}

/// Batches up items from `input` and sends the batches on `output`.
///
/// A batch is built until it either reaches `threshold` items or
/// `interval` has elapsed since its first item arrived. The pump idles
/// with no timer running until an item arrives; that item opens a new
/// batch and arms a one-shot timer. Empty batches are never emitted.
///
/// The pump exits after `input` closes, flushing any partial batch, and
/// drops its `output` sender on the way out so that channel closing
/// propagates. It also exits quietly if the output's receiver is gone.
///
/// With `threshold <= 1` every item is emitted as a singleton batch and
/// no timer is ever armed.
///
/// # Panics
///
/// Panics if the configuration is invalid (see
/// [`BatchConfig`]): a zero threshold or interval is a caller bug.
pub async fn batch<T>(
    mut input: mpsc::Receiver<T>,
    output: mpsc::Sender<Vec<T>>,
    config: BatchConfig,
) where
    T: Send,
{
    config.assert_valid();

    // Degenerate fast path: every item is its own batch.
    if config.threshold <= 1 {
        while let Some(item) = input.recv().await {
            if output.send(vec![item]).await.is_err() {
                return;
            }
        }
        return;
    }

    loop {
        // Only proceed once there is at least one item.
        let Some(first) = input.recv().await else {
            return;
        };

        let mut batch = config.new_batch(first);

        // One-shot timer rather than a ticker; its lifetime is exactly
        // one batch.
        let timer = tokio::time::sleep_until(Instant::now() + config.interval);
        tokio::pin!(timer);

        let flush_and_exit = loop {
            tokio::select! {
                () = &mut timer => break false,

                item = input.recv() => match item {
                    Some(item) => {
                        batch.push(item);
                        if batch.len() >= config.threshold {
                            break false;
                        }
                    }
                    None => break true,
                },
            }
        };

        if output.send(batch).await.is_err() {
            return;
        }
        if flush_and_exit {
            return;
        }
        // The emitted batch is gone; the next iteration opens a new one.
    }
}

// ===========================================================================
// Tests
// ===========================================================================
