//! Dependency-aware task group execution.
//!
//! This module manages tasks that depend on each other, respecting
//! dependency relationships and cancellation. It combines an error-aware
//! bounded worker pool with a [`Digraph`](crate::graph::Digraph) and
//! executes tasks in topological order.
//!
//! Create a new [`Group`], which encapsulates a dependency graph, then
//! add tasks and declare dependencies with
//! [`Group::new_task`]/[`Task::after`]. Once all tasks have been added,
//! start the group asynchronously with [`Group::start`] and wait for it
//! to finish with [`Group::wait`].
//!
//! ```rust,ignore
//! let group = Group::new(&CancellationToken::new(), Some(4));
//!
//! let fetch = group.new_task("fetch", |_| async { Ok(()) });
//! let parse = group.new_task("parse", |_| async { Ok(()) });
//! parse.after(&[&fetch]);
//!
//! group.start()?;
//! group.wait().await?;
//! ```

mod error;
mod group;


pub use error::{BoxError, GroupError};
pub use group::{Group, Task, TaskState};
