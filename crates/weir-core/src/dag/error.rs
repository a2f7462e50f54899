//! Error types for task group execution.

/// A boxed error returned from a task function.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by [`Group::start`](super::Group::start) and
/// [`Group::wait`](super::Group::wait).
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// The dependency graph contains a cycle, so no execution order
    /// exists. No task function was run.
    #[error("cycle detected in task dependencies")]
    CycleDetected,

    /// A task function returned an error, wrapped with the task's name.
    #[error("{name}: {source}")]
    Task {
        /// Name of the failed task.
        name: String,
        /// The error the task returned.
        source: BoxError,
    },

    /// The group was cancelled before every task could be admitted or
    /// could finish waiting for its dependencies.
    #[error("group cancelled")]
    Cancelled,
}

impl From<crate::graph::GraphError> for GroupError {
    fn from(err: crate::graph::GraphError) -> Self {
        match err {
            crate::graph::GraphError::CycleDetected => Self::CycleDetected,
        }
    }
}
