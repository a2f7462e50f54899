//! # Weir Core
//!
//! Reusable building blocks for constructing bounded, order-preserving,
//! failure-aware pipeline stages.
//!
//! This crate provides:
//! - **Batching**: coalesce item streams into size/time bounded batches,
//!   optionally demultiplexed per key with idle eviction ([`batch`])
//! - **Completion fence**: serialize out-of-order worker completions back
//!   into admission order with bounded concurrency ([`doneq`])
//! - **Task DAG**: run a dependency graph of tasks over a bounded pool,
//!   respecting topological order and cancellation ([`dag`])
//! - **Utilities**: sliding-window counter ([`window`]), directed graph
//!   with topological ordering ([`graph`]), pull-to-push stream bridging
//!   ([`stream`]), and lazy keyed dispatch ([`dispatch`])
//!
//! ## Design Principles
//!
//! 1. **Channel-close propagation** - closing a stage's input flushes
//!    everything in flight and then closes its output
//! 2. **No empty batches** - a batch always carries at least one item
//! 3. **Order where promised** - per-key order, admission order, and
//!    dependency order are invariants, not best effort
//! 4. **Bounded everything** - admission, concurrency, and buffering are
//!    capped at construction time
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use weir_core::batch::{spawn_batch, BatchConfig};
//!
//! let (tx, rx) = mpsc::channel(16);
//! let (batch_tx, mut batch_rx) = mpsc::channel(4);
//! spawn_batch(rx, batch_tx, BatchConfig::new(100, Duration::from_secs(1)));
//!
//! tx.send(1u64).await?;
//! drop(tx); // flushes the partial batch and closes the output
//! assert_eq!(batch_rx.recv().await, Some(vec![1]));
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod dag;
pub mod dispatch;
pub mod doneq;
pub mod graph;
pub mod stream;
pub mod window;

/// Result type for weir-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for weir-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Directed graph errors
    #[error("graph error: {0}")]
    Graph(#[from] graph::GraphError),

    /// Task DAG runner errors
    #[error("group error: {0}")]
    Group(#[from] dag::GroupError),

    /// Lazy dispatcher errors
    #[error("dispatch error: {0}")]
    Dispatch(#[from] dispatch::DispatchError),
}
