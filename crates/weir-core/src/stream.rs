//! Pull-to-push stream bridging.
//!
//! [`co_iterate`] presents an ordinary pull iterator as a concurrently
//! consumable pushed stream: a single producer task walks the iterator
//! and forwards each item through a channel until the iterator is
//! exhausted or the consumer signals [`Stop`]. The item channel closes
//! when the producer terminates, for either reason.
//!
//! ```rust,ignore
//! use tokio_stream::StreamExt;
//! use weir_core::stream::co_iterate;
//!
//! let (mut items, stop) = co_iterate(huge_tree.iter());
//! while let Some(item) = items.next().await {
//!     if item.meets_some_condition() {
//!         stop.stop();
//!         break;
//!     }
//! }
//! ```

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Stop handle for a [`co_iterate`] producer.
///
/// Consuming [`Stop::stop`] makes stopping twice unrepresentable. If the
/// handle is dropped without stopping, the producer runs the iterator to
/// exhaustion (or until the stream itself is dropped).
#[derive(Debug)]
pub struct Stop {
    token: CancellationToken,
}

impl Stop {
    /// Signals the producer to terminate without further item emission.
    /// The signal may land while the producer is mid-send; the pending
    /// item is discarded.
    pub fn stop(self) {
        self.token.cancel();
    }
}

/// Starts coroutine-style iteration over `iterator`.
///
/// Exactly one producer task is spawned. It must not require any cleanup
/// at the end of iteration, because it may be abandoned at any point.
/// An empty iterator yields an immediately closed stream.
///
/// The returned stream ends once the iterator is exhausted or [`Stop`]
/// was used; dropping the stream early also terminates the producer at
/// its next send.
pub fn co_iterate<I, T>(iterator: I) -> (ReceiverStream<T>, Stop)
where
    I: Iterator<Item = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let token = CancellationToken::new();
    let stop = token.clone();

    tokio::spawn(async move {
        for item in iterator {
            tokio::select! {
                () = stop.cancelled() => return,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        // Consumer dropped the stream.
                        return;
                    }
                }
            }
        }
    });

    (ReceiverStream::new(rx), Stop { token })
}

// ===========================================================================
// Tests
// ===========================================================================
