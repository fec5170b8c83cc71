//! Named-task scheduler with debounce, throttle, and priority draining.

pub mod queue;
pub mod task;

pub use queue::TaskScheduler;
pub use task::{TaskFuture, TaskPriority, TaskWork};
