//! Timed batching middleware.
//!
//! A batcher coalesces a stream of items into bounded batches, emitted on
//! whichever of two triggers fires first:
//!
//! - **Size**: the batch reached `threshold` items
//! - **Time**: `interval` elapsed since the batch was opened
//!
//! The batcher connects to the rest of the pipeline through two channels:
//! an input of items and an output of item batches. Closing the input
//! flushes the in-flight batch and then closes the output, so channel
//! closing propagates through the stage.
//!
//! [`batch_grouped`] layers demultiplexing on top: items are routed by a
//! key to a dedicated sub-batcher per key, all sub-batchers share one
//! output, and idle sub-batchers are evicted with a sliding window of
//! recent observations.
//!
//! # Architecture
//!
//! ```text
//!               ┌──────────────────────────────────────────┐
//!               │               batch_grouped              │
//!  items ──────►│ accept ──┬──► sub-batcher "a" ──┐        │
//!               │  │       ├──► sub-batcher "b" ──┼───────►│──► batches
//!               │  window ─┘    ...               │        │
//!               │  └─► evict ─► cleanup ──────────┘        │
//!               └──────────────────────────────────────────┘
//! ```

mod grouped;
mod timed;

pub use grouped::{batch_grouped, spawn_batch_grouped, GroupedConfig, SubCapacity};
pub use timed::{batch, spawn_batch, BatchConfig};
