//! Core done queue and its tickets.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// What the committer does with each marked progress value.
enum Mark<T> {
    /// Invoke a user callback.
    Call(Box<dyn FnMut(T) + Send>),
    /// Forward into a downstream channel (used by the batched wrappers).
    /// The send is backpressured, so a slow downstream throttles the
    /// committer and, through admission, the producer.
    Forward(mpsc::Sender<T>),
}

/// A ticket travelling from admission to the committer.
struct Pending<T> {
    progress: T,
    done: oneshot::Receiver<()>,
    /// Held until the ticket is marked, bounding admitted-but-unmarked
    /// tickets at `max`.
    _permit: OwnedSemaphorePermit,
}

/// A first-in, first-out done queue.
///
/// See the [module docs](crate::doneq) for the full protocol.
pub struct DoneQueue<T> {
    queue: mpsc::UnboundedSender<Pending<T>>,
    permits: Arc<Semaphore>,
    committer: JoinHandle<()>,
}

impl<T> fmt::Debug for DoneQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoneQueue")
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl<T> DoneQueue<T>
where
    T: Send + 'static,
{
    /// Creates a new done queue supporting at most `max` tasks in flight.
    ///
    /// `mark` is called once for every started task, in the same order
    /// the tasks were started, regardless of completion order. It runs on
    /// the committer task only.
    ///
    /// # Panics
    ///
    /// Panics if `max` is 0.
    #[must_use]
    pub fn new<F>(max: usize, mark: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        Self::with_mark(max, Mark::Call(Box::new(mark)))
    }

    /// Creates a done queue whose committer forwards marked progress into
    /// `sink` instead of calling a closure.
    pub(crate) fn forwarding(max: usize, sink: mpsc::Sender<T>) -> Self {
        Self::with_mark(max, Mark::Forward(sink))
    }

    fn with_mark(max: usize, mut mark: Mark<T>) -> Self {
        assert!(max >= 1, "done queue requires max >= 1");

        let (queue, mut tickets) = mpsc::unbounded_channel::<Pending<T>>();
        let permits = Arc::new(Semaphore::new(max));

        let committer = tokio::spawn(async move {
            while let Some(pending) = tickets.recv().await {
                let Pending {
                    progress,
                    done,
                    _permit,
                } = pending;

                // A dropped ticket counts as done: the worker forfeited
                // it, and stalling the whole fence would help nobody.
                let _ = done.await;

                match &mut mark {
                    Mark::Call(mark) => mark(progress),
                    Mark::Forward(sink) => {
                        if sink.send(progress).await.is_err() {
                            // Downstream is gone; keep draining so
                            // permits still come back to blocked starts.
                            tracing::debug!("done queue sink closed, dropping progress");
                        }
                    }
                }
                // The permit drops here, readmitting one producer.
            }
        });

        Self {
            queue,
            permits,
            committer,
        }
    }

    /// Admits a task with the provided progress indicator and returns its
    /// [`Ticket`].
    ///
    /// Blocks while `max` tickets are admitted and unmarked. The only
    /// suspension point is cancel-safe, so a caller that needs a deadline
    /// wraps the call in [`tokio::time::timeout`] (or a `select!`); on
    /// timeout nothing was admitted and no ticket exists.
    pub async fn start(&self, progress: T) -> Ticket {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("admission semaphore closed");

        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .send(Pending {
                progress,
                done: done_rx,
                _permit: permit,
            })
            .expect("committer exited before shutdown");

        Ticket { done: done_tx }
    }

    /// Shuts the queue down and returns once every admitted ticket has
    /// been marked. Consumes the queue, so no `start` can follow.
    pub async fn shutdown_wait(self) {
        tracing::debug!("done queue shutting down");
        drop(self.queue);
        let _ = self.committer.await;
    }
}

/// An admitted task's completion handle, returned from
/// [`DoneQueue::start`].
#[derive(Debug)]
pub struct Ticket {
    done: oneshot::Sender<()>,
}

impl Ticket {
    /// Marks the ticket as completed and ready to be marked in turn by
    /// the committer. Returns immediately.
    ///
    /// Consuming the ticket makes calling this twice unrepresentable.
    /// Dropping a ticket without calling `done` forfeits it; the
    /// committer treats a forfeited ticket as completed.
    pub fn done(self) {
        let _ = self.done.send(());
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_marks_in_admission_order() {
        let marks = Arc::new(Mutex::new(Vec::new()));
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();

        let queue = {
            let marks = marks.clone();
            DoneQueue::new(2, move |i: u32| marks.lock().unwrap().push(i))
        };

        // Ticket 1 finishes slowly, ticket 2 quickly; marks must still
        // come out in admission order.
        let one = queue.start(1).await;
        let exits = exit_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            one.done();
            exits.send(1).unwrap();
        });

        let two = queue.start(2).await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            two.done();
            exit_tx.send(2).unwrap();
        });

        queue.shutdown_wait().await;
        assert_eq!(*marks.lock().unwrap(), vec![1, 2]);

        // The workers themselves finished in the opposite order.
        assert_eq!(exit_rx.recv().await, Some(2));
        assert_eq!(exit_rx.recv().await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_bounded_by_max() {
        let queue = DoneQueue::new(1, |_: u32| {});

        let one = queue.start(1).await;

        // With ticket 1 unmarked, a second admission must block until
        // the deadline instead of sneaking in.
        let denied = tokio::time::timeout(Duration::from_secs(1), queue.start(2)).await;
        assert!(denied.is_err(), "second start should have timed out");

        one.done();
        let three = queue.start(3).await;
        three.done();
        queue.shutdown_wait().await;
    }

    #[tokio::test]
    async fn test_forfeited_ticket_still_marked() {
        let marks = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let marks = marks.clone();
            DoneQueue::new(2, move |i: u32| marks.lock().unwrap().push(i))
        };

        let one = queue.start(1).await;
        drop(one);
        let two = queue.start(2).await;
        two.done();

        queue.shutdown_wait().await;
        assert_eq!(*marks.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_all_marks() {
        let marks = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let marks = marks.clone();
            DoneQueue::new(4, move |i: u32| marks.lock().unwrap().push(i))
        };

        let mut tickets = Vec::new();
        for i in 0..4 {
            tickets.push(queue.start(i).await);
        }
        // Complete in reverse order.
        for ticket in tickets.into_iter().rev() {
            ticket.done();
        }

        queue.shutdown_wait().await;
        assert_eq!(*marks.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "done queue requires max >= 1")]
    fn test_zero_max_panics() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let _ = DoneQueue::new(0, |_: u32| {});
    }
}
