//! # Weir
//!
//! Building blocks for bounded, order-preserving pipeline stages:
//! timed batchers, keyed grouping batchers with idle eviction, a
//! first-in/first-out completion fence, and a dependency-aware task
//! runner.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use weir::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (tx, rx) = mpsc::channel(16);
//!     let (batch_tx, mut batch_rx) = mpsc::channel(4);
//!
//!     // Coalesce into batches of up to 100 items or 1 second, whichever
//!     // comes first.
//!     spawn_batch(rx, batch_tx, BatchConfig::new(100, Duration::from_secs(1)));
//!
//!     for i in 0..250 {
//!         tx.send(i).await.unwrap();
//!     }
//!     drop(tx);
//!
//!     while let Some(batch) = batch_rx.recv().await {
//!         println!("committing {} rows", batch.len());
//!     }
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export the component modules
pub use weir_core::{batch, dag, dispatch, doneq, graph, stream, window};

// Re-export the crate-level error rollup
pub use weir_core::{Error, Result};

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use weir_core::batch::{
        batch, batch_grouped, spawn_batch, spawn_batch_grouped, BatchConfig, GroupedConfig,
        SubCapacity,
    };
    pub use weir_core::dag::{Group, GroupError, Task, TaskState};
    pub use weir_core::doneq::{BatchedDoneQueue, DoneQueue, LastDoneQueue, Ticket};
    pub use weir_core::graph::Digraph;
    pub use weir_core::stream::co_iterate;
    pub use weir_core::window::{Counter, LockedCounter};
}
