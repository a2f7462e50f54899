//! Done-queue wrappers that mark progress in batches.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::queue::{DoneQueue, Ticket};
use crate::batch::{spawn_batch, BatchConfig};

/// A done queue that marks progress once per batch instead of once per
/// ticket.
///
/// The committer's output is fed through a [`batch`](crate::batch::batch)
/// stage, so `mark` is called with a batch of progress values every
/// `threshold` tickets or whenever `interval` elapses, whichever happens
/// first. Because the batcher preserves order and is fed by the already
/// ordered committer, batches still observe progress in admission order.
///
/// Not suitable for applications where every single task must be marked
/// the moment it completes.
pub struct BatchedDoneQueue<T> {
    inner: DoneQueue<T>,
    batcher: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl<T> BatchedDoneQueue<T>
where
    T: Send + 'static,
{
    /// Creates a new batched done queue supporting at most `max` tasks in
    /// flight, calling `mark` with each emitted batch of progress values.
    ///
    /// # Panics
    ///
    /// Panics if `max` is 0, `threshold` is 0, or `interval` is zero.
    #[must_use]
    pub fn new<F>(max: usize, mark: F, threshold: usize, interval: Duration) -> Self
    where
        F: FnMut(Vec<T>) + Send + 'static,
    {
        let config = BatchConfig::new(threshold, interval);
        config.assert_valid();

        let (progress_tx, progress_rx) = mpsc::channel(threshold);
        let (batch_tx, mut batch_rx) = mpsc::channel(1);

        let batcher = spawn_batch(progress_rx, batch_tx, config);
        let watcher = tokio::spawn(async move {
            let mut mark = mark;
            while let Some(batch) = batch_rx.recv().await {
                mark(batch);
            }
        });

        Self {
            inner: DoneQueue::forwarding(max, progress_tx),
            batcher,
            watcher,
        }
    }

    /// Admits a task with the provided progress indicator. See
    /// [`DoneQueue::start`].
    pub async fn start(&self, progress: T) -> Ticket {
        self.inner.start(progress).await
    }

    /// Shuts the queue down and returns once every admitted ticket has
    /// flowed through a marked batch. Consumes the queue, so no `start`
    /// can follow.
    pub async fn shutdown_wait(self) {
        // The committer drains, then drops its forward sender; closing
        // propagates through the batcher (flushing the partial batch)
        // and finally ends the watcher.
        self.inner.shutdown_wait().await;
        let _ = self.batcher.await;
        let _ = self.watcher.await;
    }
}

/// A done queue that marks only the last progress value of each batch.
///
/// A special case of [`BatchedDoneQueue`]: when progress values are
/// cumulative (offsets, sequence numbers), recording the last one of an
/// ordered batch is equivalent to recording them all.
pub struct LastDoneQueue<T> {
    inner: BatchedDoneQueue<T>,
}

impl<T> LastDoneQueue<T>
where
    T: Send + 'static,
{
    /// Creates a new last-only done queue. `mark` receives the final
    /// progress value of each emitted batch.
    ///
    /// # Panics
    ///
    /// Panics if `max` is 0, `threshold` is 0, or `interval` is zero.
    #[must_use]
    pub fn new<F>(max: usize, mark: F, threshold: usize, interval: Duration) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut mark = mark;
        Self {
            inner: BatchedDoneQueue::new(
                max,
                move |mut batch: Vec<T>| {
                    if let Some(last) = batch.pop() {
                        mark(last);
                    }
                },
                threshold,
                interval,
            ),
        }
    }

    /// Admits a task with the provided progress indicator. See
    /// [`DoneQueue::start`].
    pub async fn start(&self, progress: T) -> Ticket {
        self.inner.start(progress).await
    }

    /// Shuts the queue down and returns once every admitted ticket has
    /// flowed through a marked batch.
    pub async fn shutdown_wait(self) {
        self.inner.shutdown_wait().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test]
    async fn test_batched_marks_whole_batches() {
        let marks: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let marks = marks.clone();
            BatchedDoneQueue::new(
                4,
                move |batch| marks.lock().unwrap().push(batch),
                3,
                Duration::from_secs(1),
            )
        };

        for i in 0..7 {
            queue.start(i).await.done();
        }
        queue.shutdown_wait().await;

        let marks = marks.lock().unwrap();
        let flattened: Vec<u32> = marks.iter().flatten().copied().collect();
        assert_eq!(flattened, vec![0, 1, 2, 3, 4, 5, 6]);
        assert!(marks.iter().all(|b| !b.is_empty() && b.len() <= 3));
    }

    #[tokio::test]
    async fn test_last_marks_tail_of_each_batch() {
        let marks = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let marks = marks.clone();
            LastDoneQueue::new(
                4,
                move |i: u32| marks.lock().unwrap().push(i),
                3,
                Duration::from_secs(1),
            )
        };

        for i in 0..7 {
            queue.start(i).await.done();
        }
        queue.shutdown_wait().await;

        // Marks are last values of ordered batches: strictly increasing
        // and ending with the final ticket.
        let marks = marks.lock().unwrap();
        assert!(marks.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(marks.last(), Some(&6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_time_trigger_flushes() {
        let marks: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let marks = marks.clone();
            BatchedDoneQueue::new(
                2,
                move |batch| marks.lock().unwrap().push(batch),
                100,
                Duration::from_millis(10),
            )
        };

        queue.start(1).await.done();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(marks.lock().unwrap().as_slice(), &[vec![1]]);

        queue.start(2).await.done();
        queue.shutdown_wait().await;
        assert_eq!(marks.lock().unwrap().as_slice(), &[vec![1], vec![2]]);
    }
}
