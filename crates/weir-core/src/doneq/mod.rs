//! First-in, first-out done queue.
//!
//! Workers may finish out of order; a checkpoint committer must observe
//! completions *in admission order*. The done queue is the fence that
//! makes this safe: it is what lets a batch pipeline record "everything
//! up to here is finished" and resume from that point after a restart.
//!
//! Create a queue with [`DoneQueue::new`], passing a callback that
//! records task completion. When a task is read from the data source,
//! call [`DoneQueue::start`] and hand the returned [`Ticket`] to the
//! worker. When the worker finishes, it calls [`Ticket::done`].
//!
//! A single committer task consumes tickets in admission order: for each
//! ticket it waits until `done` was called, invokes the `mark` callback,
//! and only then accepts the next ticket. `mark` therefore runs on one
//! task and never concurrently; it needs no synchronization of its own.
//!
//! Admission is bounded: at most `max` tickets are admitted and not yet
//! marked at any instant, which exerts backpressure on the data source
//! through [`DoneQueue::start`].
//!
//! [`BatchedDoneQueue`] and [`LastDoneQueue`] reduce `mark` frequency by
//! feeding the committer output through a
//! [`batch`](crate::batch::batch) stage.

mod batched;
mod queue;

pub use batched::{BatchedDoneQueue, LastDoneQueue};
pub use queue::{DoneQueue, Ticket};
