use anyhow::Result;
use core::future::Future;
use core::pin::Pin;
use std::fmt;
use tokio::time::Instant;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Relative priority of a queued task. Higher values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskPriority(pub i32);

impl TaskPriority {
    pub const LOW: Self = Self(-10);
    pub const NORMAL: Self = Self(0);
    pub const HIGH: Self = Self(10);
}

/// Unit of work executed by the scheduler, either synchronous or suspending.
pub enum TaskWork {
    Sync(Box<dyn FnOnce() -> Result<()> + Send + 'static>),
    Suspending(Box<dyn FnOnce() -> TaskFuture + Send + 'static>),
}

impl TaskWork {
    pub fn from_fn<F>(work: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        TaskWork::Sync(Box::new(work))
    }

    pub fn from_future<F, Fut>(work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        TaskWork::Suspending(Box::new(move || Box::pin(work())))
    }

    pub(crate) fn into_future(self) -> TaskFuture {
        match self {
            TaskWork::Sync(work) => Box::pin(async move { work() }),
            TaskWork::Suspending(work) => work(),
        }
    }
}

impl fmt::Debug for TaskWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskWork::Sync(_) => f.write_str("TaskWork::Sync"),
            TaskWork::Suspending(_) => f.write_str("TaskWork::Suspending"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct QueuedTask {
    pub(crate) name: String,
    pub(crate) work: TaskWork,
    pub(crate) priority: TaskPriority,
    pub(crate) scheduled_at: Instant,
    /// Position in the run queue, assigned when the timer fires.
    pub(crate) sequence: u64,
}

/// Index of the next task to run: highest priority, then earliest sequence.
pub(crate) fn next_index(queue: &[QueuedTask]) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .max_by(|(_, left), (_, right)| {
            left.priority
                .cmp(&right.priority)
                .then_with(|| right.sequence.cmp(&left.sequence))
        })
        .map(|(index, _)| index)
}
