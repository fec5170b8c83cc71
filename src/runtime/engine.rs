//! Wires every component together for one content-script lifetime.

use crate::cleanup::{CleanupOrchestrator, CleanupParams, CleanupReport};
use crate::host::SharedDocument;
use crate::navigation::{NavigationHooks, NavigationOrchestrator, NavigationOutcome, NavigationParams};
use crate::observer::{ObserverCallbacks, ObserverLifecycle, ObserverParams};
use crate::runtime::config::EngineConfig;
use crate::runtime::telemetry::{self, Telemetry};
use crate::scheduler::{TaskPriority, TaskScheduler, TaskWork};
use crate::state::StateRegistry;
use anyhow::{bail, Context, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const HYGIENE_TASK: &str = "overlay-hygiene";

struct RunHandles {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// One engine instance per hosting document. Every component is created once
/// here and shared by `Arc`; there is no global state.
pub struct Engine {
    config: EngineConfig,
    document: SharedDocument,
    telemetry: Arc<Telemetry>,
    registry: Arc<StateRegistry>,
    scheduler: TaskScheduler,
    observers: Arc<ObserverLifecycle>,
    cleanup: Arc<CleanupOrchestrator>,
    navigation: Arc<NavigationOrchestrator>,
    run: Mutex<Option<RunHandles>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        document: SharedDocument,
        hooks: Arc<dyn NavigationHooks>,
        callbacks: Arc<dyn ObserverCallbacks>,
    ) -> Self {
        let telemetry = Arc::new(Telemetry::default());
        let registry = Arc::new(StateRegistry::new());
        let scheduler = TaskScheduler::new(Arc::clone(&telemetry));
        let observers = Arc::new(ObserverLifecycle::new(ObserverParams {
            document: Arc::clone(&document),
            registry: Arc::clone(&registry),
            telemetry: Arc::clone(&telemetry),
            callbacks: Arc::clone(&callbacks),
            tile_classes: config.tile_classes().to_vec(),
            url_poll_interval: config.url_poll_interval(),
        }));
        let cleanup = Arc::new(CleanupOrchestrator::new(CleanupParams {
            document: Arc::clone(&document),
            registry: Arc::clone(&registry),
            observers: Arc::clone(&observers),
            telemetry: Arc::clone(&telemetry),
            annotation_marker: config.annotation_marker().to_owned(),
            auxiliary_marker: config.auxiliary_marker().to_owned(),
            batch_size: config.cleanup_batch_size(),
            alternate_paths: config.alternate_paths().to_vec(),
        }));
        let navigation = NavigationOrchestrator::new(NavigationParams {
            document: Arc::clone(&document),
            registry: Arc::clone(&registry),
            scheduler: scheduler.clone(),
            observers: Arc::clone(&observers),
            cleanup: Arc::clone(&cleanup),
            telemetry: Arc::clone(&telemetry),
            hooks,
            callbacks,
            navigation_events: config.navigation_events().to_vec(),
        });

        Self {
            config,
            document,
            telemetry,
            registry,
            scheduler,
            observers,
            cleanup,
            navigation,
            run: Mutex::new(None),
        }
    }

    fn run(&self) -> MutexGuard<'_, Option<RunHandles>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts observers on the current page and spawns the navigation
    /// listener, metrics reporter, and hygiene loop. The current location is
    /// treated as already handled.
    pub fn start(&self) -> Result<()> {
        let mut run = self.run();
        if run.is_some() {
            bail!("engine is already running");
        }

        let location = self.document.location();
        self.navigation.prime(location.clone());
        self.observers
            .start(self.registry.current_generation())
            .context("failed to start observers")?;

        let token = CancellationToken::new();
        let listener = self.navigation.spawn_signal_listener(token.child_token());
        let metrics = telemetry::spawn_metrics_reporter(
            Arc::clone(&self.telemetry),
            Arc::clone(&self.registry),
            token.child_token(),
            self.config.metrics_interval(),
        );
        let hygiene = self.spawn_hygiene_loop(token.child_token());

        *run = Some(RunHandles {
            token,
            tasks: vec![listener, metrics, hygiene],
        });
        tracing::info!(
            target: "overlay_sync::engine",
            location = %location,
            generation = self.registry.current_generation(),
            "overlay engine started"
        );
        Ok(())
    }

    /// Stops every background task and observer and drops pending scheduled
    /// work. Annotations stay in place; call [`cleanup`](Self::cleanup) to
    /// remove them.
    pub async fn stop(&self) {
        let handles = self.run().take();
        let Some(RunHandles { token, tasks }) = handles else {
            return;
        };

        token.cancel();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(target: "overlay_sync::engine", error = %err, "background task ended abnormally");
            }
        }
        self.observers.stop();
        self.scheduler.clear();
        tracing::info!(target: "overlay_sync::engine", "overlay engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.run().is_some()
    }

    /// Runs a manual navigation cycle regardless of the last seen location.
    pub async fn force_navigation(&self) -> NavigationOutcome {
        self.navigation.force_navigation().await
    }

    /// Full cleanup outside of a navigation cycle. Observers stay stopped
    /// until the next navigation or [`restart_observers`](Self::restart_observers).
    pub async fn cleanup(&self) -> CleanupReport {
        self.cleanup.cleanup().await
    }

    /// Restarts observers under the current generation.
    pub fn restart_observers(&self) -> Result<()> {
        self.observers.start(self.registry.current_generation())
    }

    /// Removes everything when the current page uses an alternate presentation.
    pub async fn cleanup_by_page_context(&self) -> Option<CleanupReport> {
        let path = self.document.pathname();
        self.cleanup.cleanup_by_page_context(&path).await
    }

    /// Removes annotations whose anchor left the document and those older
    /// than the configured maximum age. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        prune_expired(&self.cleanup, self.config.annotation_max_age())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn observers(&self) -> &Arc<ObserverLifecycle> {
        &self.observers
    }

    pub fn navigation(&self) -> &Arc<NavigationOrchestrator> {
        &self.navigation
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn current_generation(&self) -> u64 {
        self.navigation.current_generation()
    }

    pub fn overlay_count(&self) -> usize {
        self.navigation.overlay_count()
    }

    pub fn is_navigating(&self) -> bool {
        self.navigation.is_navigating()
    }

    /// Schedules a low-priority hygiene pass on every tick. The scheduler
    /// coalesces passes that are still pending when the next tick arrives.
    fn spawn_hygiene_loop(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let cleanup = Arc::clone(&self.cleanup);
        let max_age = self.config.annotation_max_age();
        let period = self.config.hygiene_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let cleanup = Arc::clone(&cleanup);
                        scheduler.schedule_throttled(
                            HYGIENE_TASK,
                            TaskWork::from_fn(move || {
                                prune_expired(&cleanup, max_age);
                                Ok(())
                            }),
                            period,
                            TaskPriority::LOW,
                        );
                    }
                }
            }
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(run) = self.run().take() {
            run.token.cancel();
        }
    }
}

fn prune_expired(cleanup: &CleanupOrchestrator, max_age: Duration) -> usize {
    let stale = cleanup.cleanup_stale_overlays();
    let aged = cleanup.cleanup_expired_overlays(max_age);
    if stale + aged > 0 {
        tracing::debug!(
            target: "overlay_sync::engine",
            stale,
            aged,
            "hygiene pass removed annotations"
        );
    }
    stale + aged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryDocument;
    use crate::navigation::NoopHooks;
    use crate::observer::NoopCallbacks;

    fn engine(document: &MemoryDocument) -> Engine {
        Engine::new(
            EngineConfig::default(),
            document.shared(),
            Arc::new(NoopHooks),
            Arc::new(NoopCallbacks),
        )
    }

    #[tokio::test]
    async fn start_twice_fails_and_stop_is_idempotent() {
        let document = MemoryDocument::new("https://example.com/browse");
        let engine = engine(&document);

        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(engine.observers().is_running());
        let err = engine.start().unwrap_err();
        assert!(err.to_string().contains("already running"));

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
        assert!(!engine.observers().is_running());
        assert_eq!(document.active_observer_count(), 0);
    }

    #[tokio::test]
    async fn started_engine_treats_current_location_as_handled() {
        let document = MemoryDocument::new("https://example.com/browse");
        let engine = engine(&document);
        engine.start().unwrap();

        let outcome = engine
            .navigation()
            .handle_navigation(crate::navigation::NavigationSource::Manual)
            .await;

        assert_eq!(outcome, NavigationOutcome::Unchanged);
        assert_eq!(engine.current_generation(), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn page_context_cleanup_follows_the_current_path() {
        let document = MemoryDocument::new("https://example.com/browse");
        let engine = engine(&document);
        assert!(engine.cleanup_by_page_context().await.is_none());

        document.set_location("https://example.com/watch/80100172?trackId=14170286");
        assert!(engine.cleanup_by_page_context().await.is_some());
    }
}
