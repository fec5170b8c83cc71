use super::hooks::{HookError, HookFuture, HookStage, NavigationHooks};
use super::source::NavigationSource;
use crate::cleanup::CleanupOrchestrator;
use crate::host::{ElementRef, SharedDocument};
use crate::observer::{ObserverCallbacks, ObserverLifecycle};
use crate::runtime::panic::panic_message;
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::TaskScheduler;
use crate::state::StateRegistry;
use futures::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct NavigationParams {
    pub document: SharedDocument,
    pub registry: Arc<StateRegistry>,
    pub scheduler: TaskScheduler,
    pub observers: Arc<ObserverLifecycle>,
    pub cleanup: Arc<CleanupOrchestrator>,
    pub telemetry: Arc<Telemetry>,
    pub hooks: Arc<dyn NavigationHooks>,
    /// Observer callbacks for embedders; URL changes are also routed into
    /// navigation handling.
    pub callbacks: Arc<dyn ObserverCallbacks>,
    pub navigation_events: Vec<String>,
}

/// Result of one `handle_navigation` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// A full cleanup, bump, and restart ran; `generation` is the new epoch.
    Completed { generation: u64 },
    /// Another cycle was in flight; the signal was dropped.
    AlreadyNavigating,
    /// The location matched the last one handled.
    Unchanged,
}

/// Releases the navigating flag on every exit path.
struct NavigatingGuard<'a>(&'a AtomicBool);

impl Drop for NavigatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Idle/Navigating state machine driving the cleanup and restart sequence.
pub struct NavigationOrchestrator {
    document: SharedDocument,
    registry: Arc<StateRegistry>,
    scheduler: TaskScheduler,
    observers: Arc<ObserverLifecycle>,
    cleanup: Arc<CleanupOrchestrator>,
    telemetry: Arc<Telemetry>,
    hooks: RwLock<Arc<dyn NavigationHooks>>,
    routed: Arc<RoutedCallbacks>,
    navigation_events: Vec<String>,
    navigating: AtomicBool,
    last_location: Mutex<Option<String>>,
}

impl NavigationOrchestrator {
    /// Builds the orchestrator and routes the observers' URL-change callback
    /// into [`handle_navigation`](Self::handle_navigation).
    pub fn new(params: NavigationParams) -> Arc<Self> {
        let NavigationParams {
            document,
            registry,
            scheduler,
            observers,
            cleanup,
            telemetry,
            hooks,
            callbacks,
            navigation_events,
        } = params;

        let orchestrator = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            document,
            registry,
            scheduler,
            observers,
            cleanup,
            telemetry,
            hooks: RwLock::new(hooks),
            routed: Arc::new(RoutedCallbacks {
                orchestrator: weak.clone(),
                embedder: RwLock::new(callbacks),
            }),
            navigation_events,
            navigating: AtomicBool::new(false),
            last_location: Mutex::new(None),
        });
        orchestrator
            .observers
            .set_callbacks(orchestrator.routed.clone());
        orchestrator
    }

    fn last_location_guard(&self) -> MutexGuard<'_, Option<String>> {
        self.last_location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `location` as already handled without running a cycle. Used
    /// when the engine starts on a page it does not need to tear down.
    pub fn prime(&self, location: impl Into<String>) {
        *self.last_location_guard() = Some(location.into());
    }

    /// Runs one navigation cycle unless one is already in flight or the
    /// location did not change.
    ///
    /// Signals dropped while a cycle runs are not replayed. Instead, once the
    /// navigating flag is released the location is compared against the one
    /// just handled, and another cycle runs if the page moved on meanwhile.
    /// Returns the outcome of the first attempt, or of the last completed
    /// follow-up cycle.
    pub async fn handle_navigation(&self, source: NavigationSource) -> NavigationOutcome {
        let mut outcome = self.run_cycle(source).await;
        while matches!(outcome, NavigationOutcome::Completed { .. }) && self.location_moved() {
            match self.run_cycle(NavigationSource::Recheck).await {
                completed @ NavigationOutcome::Completed { .. } => outcome = completed,
                _ => break,
            }
        }
        outcome
    }

    fn location_moved(&self) -> bool {
        let location = self.document.location();
        self.last_location_guard().as_deref() != Some(location.as_str())
    }

    async fn run_cycle(&self, source: NavigationSource) -> NavigationOutcome {
        if self
            .navigating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.telemetry.record_navigation_dropped();
            tracing::debug!(
                target: "overlay_sync::navigation",
                %source,
                "navigation already in progress; dropping signal"
            );
            return NavigationOutcome::AlreadyNavigating;
        }
        let _navigating = NavigatingGuard(&self.navigating);

        let location = self.document.location();
        {
            let mut last = self.last_location_guard();
            if last.as_deref() == Some(location.as_str()) {
                tracing::trace!(target: "overlay_sync::navigation", %source, "location unchanged");
                return NavigationOutcome::Unchanged;
            }
            *last = Some(location.clone());
        }

        tracing::debug!(
            target: "overlay_sync::navigation",
            %source,
            location = %location,
            generation = self.registry.current_generation(),
            "navigation started"
        );

        let hooks = self.hooks();
        run_hook(&self.telemetry, HookStage::BeforeCleanup, || {
            hooks.on_before_cleanup()
        })
        .await;
        self.scheduler.clear();
        self.observers.stop();
        let report = self.cleanup.cleanup().await;
        run_hook(&self.telemetry, HookStage::AfterCleanup, || {
            hooks.on_after_cleanup()
        })
        .await;

        let generation = self.registry.bump_generation();
        if let Err(err) = self.observers.start(generation) {
            tracing::warn!(
                target: "overlay_sync::navigation",
                generation,
                error = ?err,
                "failed to restart observers after navigation"
            );
        }
        run_hook(&self.telemetry, HookStage::NavigationComplete, || {
            hooks.on_navigation_complete(&location)
        })
        .await;

        self.telemetry.record_navigation_completed();
        tracing::info!(
            target: "overlay_sync::navigation",
            %source,
            location = %location,
            generation,
            removed = report.total_removed(),
            markers_cleared = report.markers_cleared,
            removal_failures = report.failures,
            "navigation complete"
        );
        NavigationOutcome::Completed { generation }
    }

    /// Forgets the last handled location and runs a manual cycle.
    pub async fn force_navigation(&self) -> NavigationOutcome {
        self.last_location_guard().take();
        self.handle_navigation(NavigationSource::Manual).await
    }

    /// Listens for the configured SPA navigation events until `shutdown` is
    /// cancelled. Every matching event spawns its own navigation attempt so a
    /// burst collapses through the navigating flag instead of queueing.
    pub fn spawn_signal_listener(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut events = self.document.events();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(name) => {
                        if orchestrator.navigation_events.iter().any(|event| *event == name) {
                            orchestrator.spawn_navigation(NavigationSource::SpaEvent(name));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "overlay_sync::navigation",
                            skipped,
                            "navigation listener lagged; re-checking location"
                        );
                        orchestrator.spawn_navigation(NavigationSource::Manual);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            tracing::debug!(target: "overlay_sync::navigation", "navigation signal listener stopped");
        })
    }

    fn spawn_navigation(self: &Arc<Self>, source: NavigationSource) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.handle_navigation(source).await;
        });
    }

    fn hooks(&self) -> Arc<dyn NavigationHooks> {
        Arc::clone(&self.hooks.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the hooks used by subsequent navigation cycles.
    pub fn set_hooks(&self, hooks: Arc<dyn NavigationHooks>) {
        *self.hooks.write().unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    /// Replaces the embedder callbacks that observers forward to.
    pub fn set_observer_callbacks(&self, callbacks: Arc<dyn ObserverCallbacks>) {
        *self
            .routed
            .embedder
            .write()
            .unwrap_or_else(PoisonError::into_inner) = callbacks;
    }

    pub fn current_generation(&self) -> u64 {
        self.registry.current_generation()
    }

    pub fn overlay_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_navigating(&self) -> bool {
        self.navigating.load(Ordering::SeqCst)
    }

    pub fn last_location(&self) -> Option<String> {
        self.last_location_guard().clone()
    }
}

/// Awaits a hook, turning errors and panics into log lines.
async fn run_hook<'a>(
    telemetry: &Telemetry,
    stage: HookStage,
    hook: impl FnOnce() -> HookFuture<'a>,
) {
    let result = match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "hook panicked: {}",
                panic_message(panic.as_ref())
            )),
        },
        Err(panic) => Err(anyhow::anyhow!(
            "hook panicked: {}",
            panic_message(panic.as_ref())
        )),
    };

    if let Err(source) = result {
        telemetry.record_hook_failure();
        let err = HookError::new(stage, source);
        tracing::warn!(
            target: "overlay_sync::navigation",
            stage = ?err.stage(),
            error = %err,
            "navigation hook failed; continuing"
        );
    }
}

/// Observer callbacks installed by the orchestrator: URL changes start a
/// navigation, and everything is forwarded to the embedder's callbacks.
struct RoutedCallbacks {
    orchestrator: Weak<NavigationOrchestrator>,
    embedder: RwLock<Arc<dyn ObserverCallbacks>>,
}

impl RoutedCallbacks {
    fn embedder(&self) -> Arc<dyn ObserverCallbacks> {
        Arc::clone(&self.embedder.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ObserverCallbacks for RoutedCallbacks {
    fn on_dom_mutation(&self, tiles: Vec<ElementRef>) {
        self.embedder().on_dom_mutation(tiles);
    }

    fn on_url_change(&self, new_url: &str, old_url: &str) {
        self.embedder().on_url_change(new_url, old_url);
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.spawn_navigation(NavigationSource::UrlPoll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupParams;
    use crate::host::{HostDocument, MemoryDocument};
    use crate::navigation::NoopHooks;
    use crate::observer::{NoopCallbacks, ObserverParams};
    use crate::scheduler::{TaskPriority, TaskWork};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
        fail_before: bool,
        panic_after: bool,
    }

    impl NavigationHooks for Recording {
        fn on_before_cleanup(&self) -> HookFuture<'_> {
            Box::pin(async move {
                self.calls.lock().unwrap().push("before".to_owned());
                if self.fail_before {
                    anyhow::bail!("before hook failed");
                }
                Ok(())
            })
        }

        fn on_after_cleanup(&self) -> HookFuture<'_> {
            self.calls.lock().unwrap().push("after".to_owned());
            if self.panic_after {
                panic!("after hook exploded");
            }
            Box::pin(async { Ok(()) })
        }

        fn on_navigation_complete<'a>(&'a self, url: &'a str) -> HookFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(format!("complete {url}"));
                Ok(())
            })
        }
    }

    fn build(document: &MemoryDocument, hooks: Arc<dyn NavigationHooks>) -> Arc<NavigationOrchestrator> {
        let shared = document.shared();
        let registry = Arc::new(StateRegistry::default());
        let telemetry = Arc::new(Telemetry::default());
        let observers = Arc::new(ObserverLifecycle::new(ObserverParams {
            document: Arc::clone(&shared),
            registry: Arc::clone(&registry),
            telemetry: Arc::clone(&telemetry),
            callbacks: Arc::new(NoopCallbacks),
            tile_classes: vec!["title-card".to_owned()],
            url_poll_interval: Duration::from_millis(500),
        }));
        let cleanup = Arc::new(CleanupOrchestrator::new(CleanupParams {
            document: Arc::clone(&shared),
            registry: Arc::clone(&registry),
            observers: Arc::clone(&observers),
            telemetry: Arc::clone(&telemetry),
            annotation_marker: "data-overlay-annotation".to_owned(),
            auxiliary_marker: "data-overlay-anchor".to_owned(),
            batch_size: 20,
            alternate_paths: vec!["/watch".to_owned()],
        }));
        NavigationOrchestrator::new(NavigationParams {
            document: shared,
            registry,
            scheduler: TaskScheduler::new(Arc::clone(&telemetry)),
            observers,
            cleanup,
            telemetry,
            hooks,
            callbacks: Arc::new(NoopCallbacks),
            navigation_events: vec!["popstate".to_owned(), "locationchange".to_owned()],
        })
    }

    #[tokio::test]
    async fn completed_cycle_runs_hooks_in_order_and_bumps_generation() {
        let document = MemoryDocument::new("https://example.com/browse");
        let hooks = Arc::new(Recording::default());
        let orchestrator = build(&document, hooks.clone());

        let outcome = orchestrator.handle_navigation(NavigationSource::Manual).await;

        assert_eq!(outcome, NavigationOutcome::Completed { generation: 1 });
        assert_eq!(
            *hooks.calls.lock().unwrap(),
            vec!["before", "after", "complete https://example.com/browse"]
        );
        assert!(orchestrator.observers.is_running());
        assert_eq!(orchestrator.observers.generation(), 1);
        assert!(!orchestrator.is_navigating());
        assert_eq!(
            orchestrator.last_location().as_deref(),
            Some("https://example.com/browse")
        );
    }

    /// Moves the page once, from inside the first before-cleanup hook.
    struct MovesDuringCleanup {
        document: MemoryDocument,
        target: &'static str,
        moved: AtomicBool,
    }

    impl NavigationHooks for MovesDuringCleanup {
        fn on_before_cleanup(&self) -> HookFuture<'_> {
            Box::pin(async move {
                if !self.moved.swap(true, Ordering::SeqCst) {
                    self.document.set_location(self.target);
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn location_change_during_a_cycle_runs_a_follow_up_cycle() {
        let document = MemoryDocument::new("https://example.com/a");
        let hooks = Arc::new(MovesDuringCleanup {
            document: document.clone(),
            target: "https://example.com/b",
            moved: AtomicBool::new(false),
        });
        let orchestrator = build(&document, hooks);

        let outcome = orchestrator.handle_navigation(NavigationSource::Manual).await;

        assert_eq!(outcome, NavigationOutcome::Completed { generation: 2 });
        assert_eq!(
            orchestrator.last_location().as_deref(),
            Some("https://example.com/b")
        );
        assert!(!orchestrator.is_navigating());
    }

    #[tokio::test]
    async fn unchanged_location_is_a_noop() {
        let document = MemoryDocument::new("https://example.com/browse");
        let orchestrator = build(&document, Arc::new(NoopHooks));
        orchestrator.prime(document.location());

        let outcome = orchestrator
            .handle_navigation(NavigationSource::SpaEvent("popstate".to_owned()))
            .await;

        assert_eq!(outcome, NavigationOutcome::Unchanged);
        assert_eq!(orchestrator.current_generation(), 0);
    }

    #[tokio::test]
    async fn concurrent_signals_collapse_into_one_cycle() {
        let document = MemoryDocument::new("https://example.com/browse");
        let orchestrator = build(&document, Arc::new(NoopHooks));
        orchestrator.prime(document.location());
        document.set_location("https://example.com/browse/my-list");

        let (first, second) = tokio::join!(
            orchestrator.handle_navigation(NavigationSource::SpaEvent("popstate".to_owned())),
            orchestrator.handle_navigation(NavigationSource::SpaEvent("locationchange".to_owned())),
        );

        let completed = [first, second]
            .iter()
            .filter(|outcome| matches!(outcome, NavigationOutcome::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
        assert_eq!(orchestrator.current_generation(), 1);
    }

    #[tokio::test]
    async fn hook_failures_and_panics_do_not_stop_the_sequence() {
        let document = MemoryDocument::new("https://example.com/browse");
        let hooks = Arc::new(Recording {
            fail_before: true,
            panic_after: true,
            ..Recording::default()
        });
        let orchestrator = build(&document, hooks.clone());

        let outcome = orchestrator.force_navigation().await;

        assert_eq!(outcome, NavigationOutcome::Completed { generation: 1 });
        assert_eq!(hooks.calls.lock().unwrap().len(), 3);
        assert_eq!(orchestrator.telemetry.snapshot().hook_failures, 2);
        assert!(!orchestrator.is_navigating());
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_cancels_pending_scheduled_work() {
        let document = MemoryDocument::new("https://example.com/browse");
        let orchestrator = build(&document, Arc::new(NoopHooks));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        orchestrator.scheduler.schedule(
            "enhance",
            TaskWork::from_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Duration::from_millis(200),
            TaskPriority::NORMAL,
        );

        orchestrator.force_navigation().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(orchestrator.scheduler.is_idle());
    }

    #[tokio::test]
    async fn spa_events_drive_navigation() {
        let document = MemoryDocument::new("https://example.com/browse");
        let orchestrator = build(&document, Arc::new(NoopHooks));
        orchestrator.prime(document.location());
        let shutdown = CancellationToken::new();
        let listener = orchestrator.spawn_signal_listener(shutdown.clone());

        document.push_state("https://example.com/browse/genre/83", "locationchange");
        document.dispatch_event("unrelated");
        tokio::time::timeout(Duration::from_secs(1), async {
            while orchestrator.current_generation() == 0 || orchestrator.is_navigating() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("navigation should complete");

        shutdown.cancel();
        listener.await.unwrap();
        assert_eq!(orchestrator.current_generation(), 1);
    }
}
