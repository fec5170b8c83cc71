//! Debounced, throttled, priority-ordered execution of named tasks.
//!
//! Every `schedule` call arms a timer keyed by the task name; re-scheduling the
//! same name aborts the previous timer. When a timer fires its task moves into
//! the run queue, replacing any queued task of the same name, and a single
//! drain loop executes queued tasks one at a time.

use super::task::{next_index, QueuedTask, TaskPriority, TaskWork};
use crate::runtime::panic::panic_message;
use crate::runtime::telemetry::Telemetry;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

struct PendingTimer {
    ticket: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    timers: HashMap<String, PendingTimer>,
    queue: Vec<QueuedTask>,
    last_completed: HashMap<String, Instant>,
    draining: bool,
    next_ticket: u64,
}

impl SchedulerState {
    fn is_idle(&self) -> bool {
        self.timers.is_empty() && self.queue.is_empty() && !self.draining
    }

    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        ticket
    }
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    idle: Notify,
    telemetry: Arc<Telemetry>,
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves a task whose timer expired into the run queue.
    fn fire(self: &Arc<Self>, mut task: QueuedTask, ticket: u64) {
        let start_drain = {
            let mut state = self.state();
            match state.timers.get(&task.name) {
                Some(timer) if timer.ticket == ticket => {}
                _ => return,
            }
            state.timers.remove(&task.name);

            let before = state.queue.len();
            state.queue.retain(|queued| queued.name != task.name);
            if state.queue.len() != before {
                self.telemetry.record_task_debounced();
            }
            task.sequence = state.take_ticket();
            state.queue.push(task);

            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if start_drain {
            tokio::spawn(Self::drain(Arc::clone(self)));
        }
    }

    async fn drain(inner: Arc<Self>) {
        loop {
            let next = {
                let mut state = inner.state();
                match next_index(&state.queue) {
                    Some(index) => state.queue.remove(index),
                    None => {
                        state.draining = false;
                        drop(state);
                        inner.idle.notify_waiters();
                        return;
                    }
                }
            };

            let QueuedTask {
                name,
                work,
                priority,
                scheduled_at,
                ..
            } = next;
            tracing::trace!(
                task = %name,
                priority = priority.0,
                waited_ms = scheduled_at.elapsed().as_millis() as u64,
                "running scheduled task"
            );

            match AssertUnwindSafe(work.into_future()).catch_unwind().await {
                Ok(Ok(())) => inner.telemetry.record_task_executed(),
                Ok(Err(err)) => {
                    inner.telemetry.record_task_failed();
                    tracing::warn!(task = %name, error = %err, "scheduled task failed");
                }
                Err(panic_payload) => {
                    inner.telemetry.record_task_failed();
                    tracing::error!(
                        task = %name,
                        panic = %panic_message(panic_payload.as_ref()),
                        "scheduled task panicked"
                    );
                }
            }

            inner.state().last_completed.insert(name, Instant::now());
        }
    }
}

/// Handle to the shared scheduler. Cloning is cheap; all clones drive the same
/// queue.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::default()),
                idle: Notify::new(),
                telemetry,
            }),
        }
    }

    /// Schedules `work` under `name` after `delay`, replacing any pending task
    /// with the same name. Must be called from within a tokio runtime.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        work: TaskWork,
        delay: Duration,
        priority: TaskPriority,
    ) {
        let name = name.into();
        debug_assert!(!name.is_empty(), "scheduled task names must not be empty");

        // The lock is held across spawn so the timer cannot fire before its
        // ticket is registered.
        let mut state = self.inner.state();
        let ticket = state.take_ticket();
        if let Some(previous) = state.timers.remove(&name) {
            previous.handle.abort();
            self.inner.telemetry.record_task_debounced();
            tracing::trace!(task = %name, "debounced pending task");
        }

        let task = QueuedTask {
            name: name.clone(),
            work,
            priority,
            scheduled_at: Instant::now(),
            sequence: 0,
        };
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                sleep(delay).await;
            }
            inner.fire(task, ticket);
        });
        state.timers.insert(name, PendingTimer { ticket, handle });
    }

    /// Schedules `work` so that `name` runs at most once per `min_interval`,
    /// measured from the last completed run.
    pub fn schedule_throttled(
        &self,
        name: impl Into<String>,
        work: TaskWork,
        min_interval: Duration,
        priority: TaskPriority,
    ) {
        let name = name.into();
        let since_last = self
            .inner
            .state()
            .last_completed
            .get(&name)
            .map(|completed| completed.elapsed());

        let delay = match since_last {
            Some(elapsed) if elapsed < min_interval => min_interval - elapsed,
            _ => Duration::ZERO,
        };
        self.schedule(name, work, delay, priority);
    }

    /// Cancels every pending timer and empties the run queue. A task that is
    /// already executing runs to completion.
    pub fn clear(&self) {
        let (timers, queued) = {
            let mut state = self.inner.state();
            let timers: Vec<PendingTimer> = state.timers.drain().map(|(_, timer)| timer).collect();
            let queued = state.queue.len();
            state.queue.clear();
            (timers, queued)
        };

        let cancelled = timers.len();
        for timer in timers {
            timer.handle.abort();
        }
        self.inner.idle.notify_waiters();

        if cancelled > 0 || queued > 0 {
            tracing::debug!(cancelled, queued, "cleared task scheduler");
        }
    }

    /// Cancels the pending or queued task named `name`. Returns whether
    /// anything was cancelled.
    pub fn clear_task(&self, name: &str) -> bool {
        let cancelled = {
            let mut state = self.inner.state();
            let timer = state.timers.remove(name);
            let before = state.queue.len();
            state.queue.retain(|queued| queued.name != name);
            let dequeued = state.queue.len() != before;
            match timer {
                Some(timer) => {
                    timer.handle.abort();
                    true
                }
                None => dequeued,
            }
        };

        if cancelled {
            self.inner.idle.notify_waiters();
        }
        cancelled
    }

    /// Resolves once no timer is pending, the queue is empty, and the drain
    /// loop has finished its current task.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.state().is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state().timers.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state().draining
    }

    pub fn is_idle(&self) -> bool {
        self.inner.state().is_idle()
    }

    /// When `name` last finished running, if ever.
    pub fn last_completed(&self, name: &str) -> Option<Instant> {
        self.inner.state().last_completed.get(name).copied()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(Arc::new(Telemetry::default()))
    }
}
