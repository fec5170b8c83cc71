use crate::state::StateRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Engine-wide counters. Every component holds the same `Arc<Telemetry>`.
#[derive(Default, Debug)]
pub struct Telemetry {
    navigations_completed: AtomicU64,
    navigations_dropped: AtomicU64,
    cleanups: AtomicU64,
    elements_removed: AtomicU64,
    removal_failures: AtomicU64,
    hook_failures: AtomicU64,
    tasks_executed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_debounced: AtomicU64,
    stale_observer_disconnects: AtomicU64,
}

impl Telemetry {
    pub fn record_navigation_completed(&self) {
        self.navigations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_navigation_dropped(&self) {
        self.navigations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removals(&self, removed: usize, failures: usize) {
        if removed > 0 {
            self.elements_removed
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        if failures > 0 {
            self.removal_failures
                .fetch_add(failures as u64, Ordering::Relaxed);
        }
    }

    pub fn record_hook_failure(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_executed(&self) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_debounced(&self) {
        self.tasks_debounced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_observer_disconnect(&self) {
        self.stale_observer_disconnects
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn navigations_completed(&self) -> u64 {
        self.navigations_completed.load(Ordering::Relaxed)
    }

    pub fn stale_observer_disconnects(&self) -> u64 {
        self.stale_observer_disconnects.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            navigations_completed: self.navigations_completed.load(Ordering::Relaxed),
            navigations_dropped: self.navigations_dropped.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            elements_removed: self.elements_removed.load(Ordering::Relaxed),
            removal_failures: self.removal_failures.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_debounced: self.tasks_debounced.load(Ordering::Relaxed),
            stale_observer_disconnects: self.stale_observer_disconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub navigations_completed: u64,
    pub navigations_dropped: u64,
    pub cleanups: u64,
    pub elements_removed: u64,
    pub removal_failures: u64,
    pub hook_failures: u64,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub tasks_debounced: u64,
    pub stale_observer_disconnects: u64,
}

/// Spawns a background task that periodically logs navigation, cleanup and task counters
/// along with the number of live annotations.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    registry: Arc<StateRegistry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "overlay_sync::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    if current == last_snapshot && registry.is_empty() {
                        continue;
                    }

                    tracing::info!(
                        target: "overlay_sync::metrics",
                        generation = registry.current_generation(),
                        annotations = registry.len(),
                        navigations = current.navigations_completed,
                        navigations_dropped = current.navigations_dropped,
                        cleanups = current.cleanups,
                        elements_removed = current.elements_removed,
                        removal_failures = current.removal_failures,
                        hook_failures = current.hook_failures,
                        tasks_executed = current.tasks_executed,
                        tasks_failed = current.tasks_failed,
                        tasks_debounced = current.tasks_debounced,
                        stale_observers = current.stale_observer_disconnects,
                        "engine metrics snapshot"
                    );

                    last_snapshot = current;
                }
            }
        }
    })
}
