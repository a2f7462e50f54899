//! Task group construction and execution.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::{BoxError, GroupError};
use crate::graph::Digraph;

/// A boxed task function future.
type TaskFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
/// A task function, boxed for storage until the starter dispatches it.
type TaskFn = Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send>;

/// Vertex identity in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TaskId(u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Observable lifecycle of a task.
///
/// States advance monotonically; a task that is pre-empted by
/// cancellation while waiting never reaches `Running` or `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Added to the group; the group has not dispatched it yet.
    Created = 0,
    /// The starter has dequeued it from the topological order.
    Dequeued = 1,
    /// Waiting for a worker-pool slot (concurrency limit).
    WaitingForSlot = 2,
    /// Holding a slot, waiting for predecessor completion signals.
    WaitingForDependencies = 3,
    /// The task function is running.
    Running = 4,
    /// The task function returned.
    Finished = 5,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Dequeued,
            2 => Self::WaitingForSlot,
            3 => Self::WaitingForDependencies,
            4 => Self::Running,
            _ => Self::Finished,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Created => "created",
            Self::Dequeued => "dequeued",
            Self::WaitingForSlot => "waiting for slot",
            Self::WaitingForDependencies => "waiting for dependencies",
            Self::Running => "running",
            Self::Finished => "finished",
        };
        f.write_str(text)
    }
}

struct TaskInner {
    id: TaskId,
    name: String,
    /// Taken exactly once by the worker when the task runs.
    func: Mutex<Option<TaskFn>>,
    /// Current `TaskState`, readable at any time.
    state: AtomicU8,
    /// Completion signal, created lazily by the starter only if some
    /// successor needs to wait on this task.
    done_tx: Mutex<Option<watch::Sender<bool>>>,
    /// Predecessor completion signals. The starter is the only writer,
    /// and the topological order guarantees every write lands before
    /// this task's worker takes the list.
    wait_for: Mutex<Vec<watch::Receiver<bool>>>,
}

impl TaskInner {
    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Signals completion to any waiting successors. Only ever called on
    /// successful completion; on failure or pre-emption the group token
    /// is already cancelled, and successors wake through it instead.
    fn signal_done(&self) {
        if let Some(done) = self.done_tx.lock().take() {
            let _ = done.send(true);
        }
    }
}

/// Pre-start mutable state: the dependency graph and the task registry.
struct Builder {
    graph: Digraph<TaskId>,
    tasks: FxHashMap<TaskId, Arc<TaskInner>>,
    next_id: u32,
    started: bool,
}

struct GroupShared {
    /// Derived token handed to task functions; cancelled on first error.
    token: CancellationToken,
    /// Worker pool slots; `None` disables the limit.
    limit: Option<Arc<Semaphore>>,
    /// First error observed (task failure or cancellation while
    /// waiting).
    first_error: Mutex<Option<GroupError>>,
    /// Set by the starter when cancellation pre-empted admission.
    saved_cancel: Mutex<Option<GroupError>>,
    builder: Mutex<Builder>,
}

impl GroupShared {
    /// Records the first error and cancels the group context, making
    /// sibling and successor tasks observe cancellation.
    fn record_error(&self, error: GroupError) {
        {
            let mut slot = self.first_error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.token.cancel();
    }
}

/// A handle to one task in a [`Group`].
///
/// Retain the handle to declare dependencies with [`Task::after`] and to
/// read the task's state; there is no lookup by name.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
    group: Arc<GroupShared>,
}

impl Task {
    /// Establishes an ordering: all `befores` complete before this task
    /// starts. Declaring the same dependency twice is a no-op.
    ///
    /// Returns the task to allow the chained form
    /// `group.new_task(...).after(&[&prerequisite])`.
    ///
    /// # Panics
    ///
    /// Panics if the group has already started, if the task is asked to
    /// depend on itself, or if a dependency belongs to another group.
    /// All are caller bugs.
    pub fn after(&self, befores: &[&Task]) -> &Self {
        for before in befores {
            assert!(
                !Arc::ptr_eq(&self.inner, &before.inner),
                "task cannot depend on itself"
            );
            assert!(
                Arc::ptr_eq(&self.group, &before.group),
                "tasks were not created from the same group"
            );
        }

        let mut builder = self.group.builder.lock();
        assert!(!builder.started, "group already started");
        for before in befores {
            builder.graph.add_edge(before.inner.id, self.inner.id);
        }

        self
    }

    /// Returns the task's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the task's current state. The value is a snapshot; the
    /// task may advance at any moment.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.state()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.inner.name, self.inner.state())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state())
            .finish()
    }
}

/// A group of tasks with dependency relationships, executed over a
/// bounded worker pool in topological order.
///
/// See the [module docs](crate::dag) for usage.
pub struct Group {
    shared: Arc<GroupShared>,
    starter: Mutex<Option<JoinHandle<Vec<JoinHandle<()>>>>>,
}

impl Group {
    /// Creates a new group. A child of `parent` is derived and passed to
    /// every task function; it is cancelled as soon as any task returns
    /// an error.
    ///
    /// `limit` is the maximum number of tasks that may run
    /// simultaneously; `None` disables the limit.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is `Some(0)`.
    #[must_use]
    pub fn new(parent: &CancellationToken, limit: Option<usize>) -> Self {
        let limit = limit.map(|n| {
            assert!(n >= 1, "concurrency limit must be at least 1");
            Arc::new(Semaphore::new(n))
        });

        Self {
            shared: Arc::new(GroupShared {
                token: parent.child_token(),
                limit,
                first_error: Mutex::new(None),
                saved_cancel: Mutex::new(None),
                builder: Mutex::new(Builder {
                    graph: Digraph::new(),
                    tasks: FxHashMap::default(),
                    next_id: 0,
                    started: false,
                }),
            }),
            starter: Mutex::new(None),
        }
    }

    /// Creates a new task in this group. `f` receives a token that is
    /// cancelled after any other task returns an error; a well-behaved
    /// task passes it along to whatever it blocks on.
    ///
    /// `name` appears in the group's `Display` output and in the wrapped
    /// error if the task fails.
    ///
    /// # Panics
    ///
    /// Panics if the group has already started.
    pub fn new_task<F, Fut>(&self, name: impl Into<String>, f: F) -> Task
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let func: TaskFn = Box::new(move |token| Box::pin(f(token)));

        let mut builder = self.shared.builder.lock();
        assert!(!builder.started, "group already started");

        let id = TaskId(builder.next_id);
        builder.next_id += 1;

        let inner = Arc::new(TaskInner {
            id,
            name: name.into(),
            func: Mutex::new(Some(func)),
            state: AtomicU8::new(TaskState::Created as u8),
            done_tx: Mutex::new(None),
            wait_for: Mutex::new(Vec::new()),
        });

        builder.graph.add_node(id);
        builder.tasks.insert(id, inner.clone());

        Task {
            inner,
            group: self.shared.clone(),
        }
    }

    /// Starts the group's tasks in dependency order.
    ///
    /// Scheduling is asynchronous: `start` validates the graph, spawns
    /// the starter, and returns. The actual execution order across
    /// repeated runs of the same graph is not guaranteed to be
    /// identical.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::CycleDetected`] if no topological order
    /// exists. No task function has run in that case.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn start(&self) -> Result<(), GroupError> {
        let order = {
            let mut builder = self.shared.builder.lock();
            assert!(!builder.started, "group already started");
            // Blocks concurrent start and freezes the dependency graph.
            builder.started = true;

            let order = builder.graph.topological_order()?;
            order
                .into_iter()
                .map(|id| {
                    let task = builder.tasks[&id].clone();
                    let successors = builder
                        .graph
                        .neighbors(&id)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|sid| builder.tasks[&sid].clone())
                        .collect();
                    (task, successors)
                })
                .collect()
        };

        let shared = self.shared.clone();
        *self.starter.lock() = Some(tokio::spawn(starter(shared, order)));

        Ok(())
    }

    /// Waits for every started task to exit.
    ///
    /// # Errors
    ///
    /// Returns the first error returned from any task, or else the
    /// cancellation that prevented all tasks from starting. `Ok(())`
    /// means every task completed successfully.
    ///
    /// # Panics
    ///
    /// Resumes the unwind of any task function that panicked.
    pub async fn wait(self) -> Result<(), GroupError> {
        let starter = self.starter.lock().take();
        if let Some(starter) = starter {
            let workers = starter.await.expect("starter task panicked");
            for worker in workers {
                if let Err(e) = worker.await {
                    if e.is_panic() {
                        std::panic::resume_unwind(e.into_panic());
                    }
                }
            }
        }

        let error = {
            let first = self.shared.first_error.lock().take();
            first.or_else(|| self.shared.saved_cancel.lock().take())
        };
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Group {
    /// Renders the group's start flag and its dependency relationships,
    /// one task per line in lexicographic order:
    /// `name [state] -> successor successor`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let builder = self.shared.builder.lock();
        writeln!(f, "Group: started={}", builder.started)?;

        let mut lines: Vec<(String, Vec<String>)> = builder
            .tasks
            .values()
            .map(|task| {
                let mut outs: Vec<String> = builder
                    .graph
                    .neighbors(&task.id)
                    .unwrap_or_default()
                    .iter()
                    .map(|sid| builder.tasks[sid].name.clone())
                    .collect();
                outs.sort_unstable();
                (format!("{} [{}]", task.name, task.state()), outs)
            })
            .collect();
        lines.sort_unstable();

        for (i, (label, outs)) in lines.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{label} ->")?;
            for out in outs {
                write!(f, " {out}")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Walks the topological order, wiring completion signals and admitting
/// each task to the worker pool. Returns the worker handles for `wait`.
async fn starter(
    shared: Arc<GroupShared>,
    order: Vec<(Arc<TaskInner>, Vec<Arc<TaskInner>>)>,
) -> Vec<JoinHandle<()>> {
    let mut workers = Vec::with_capacity(order.len());

    for (task, successors) in order {
        task.set_state(TaskState::Dequeued);

        if shared.token.is_cancelled() {
            // Remember that at least one task was prevented from
            // starting, in case every admitted task still exits cleanly.
            *shared.saved_cancel.lock() = Some(GroupError::Cancelled);
            tracing::debug!(task = %task.name, "cancelled before admission");
            break;
        }

        if !successors.is_empty() {
            let (done_tx, done_rx) = watch::channel(false);
            *task.done_tx.lock() = Some(done_tx);
            for successor in &successors {
                // Single-writer: only the starter appends, and the
                // topological order means every append happens before
                // the successor's worker reads the list.
                successor.wait_for.lock().push(done_rx.clone());
            }
        }

        task.set_state(TaskState::WaitingForSlot);
        let permit = match &shared.limit {
            Some(pool) => Some(
                pool.clone()
                    .acquire_owned()
                    .await
                    .expect("worker pool semaphore closed"),
            ),
            None => None,
        };

        let shared = shared.clone();
        workers.push(tokio::spawn(async move {
            let _permit = permit;
            run_task(&shared, &task).await;
        }));
    }

    workers
}

/// Runs one task: waits for its predecessors (or cancellation), then
/// invokes its function and propagates the outcome.
async fn run_task(shared: &GroupShared, task: &TaskInner) {
    task.set_state(TaskState::WaitingForDependencies);

    let wait_for = std::mem::take(&mut *task.wait_for.lock());
    for mut done in wait_for {
        tokio::select! {
            () = shared.token.cancelled() => {
                // Pre-empted while waiting. A predecessor that failed
                // never signals, so this is also how the downstream of a
                // failure skips: its error is recorded and the token
                // cancelled before this task can wake.
                shared.record_error(GroupError::Cancelled);
                return;
            }
            changed = done.wait_for(|finished| *finished) => {
                let _ = changed;
            }
        }
    }

    task.set_state(TaskState::Running);
    tracing::trace!(task = %task.name, "running");
    let func = task
        .func
        .lock()
        .take()
        .expect("task function dispatched twice");
    let result = func(shared.token.clone()).await;
    task.set_state(TaskState::Finished);

    match result {
        Ok(()) => task.signal_done(),
        Err(source) => {
            tracing::debug!(task = %task.name, error = %source, "task failed");
            shared.record_error(GroupError::Task {
                name: task.name.clone(),
                source,
            });
        }
    }
}
