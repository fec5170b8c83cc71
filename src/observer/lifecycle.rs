use super::callbacks::{invoke_guarded, CallbackSlot, ObserverCallbacks, TileCallback};
use super::poll::spawn_location_poller;
use super::tiles::TileObservers;
use crate::host::{
    ElementId, ElementRef, MutationBatch, MutationSubscription, ObserveOptions, SharedDocument,
    SubscriptionHandle,
};
use crate::runtime::telemetry::Telemetry;
use crate::state::StateRegistry;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ObserverParams {
    pub document: SharedDocument,
    pub registry: Arc<StateRegistry>,
    pub telemetry: Arc<Telemetry>,
    pub callbacks: Arc<dyn ObserverCallbacks>,
    pub tile_classes: Vec<String>,
    pub url_poll_interval: Duration,
}

struct ObserverShared {
    document: SharedDocument,
    registry: Arc<StateRegistry>,
    telemetry: Arc<Telemetry>,
    callbacks: Arc<CallbackSlot>,
    tile_classes: Vec<String>,
    url_poll_interval: Duration,
    generation: AtomicU64,
}

impl ObserverShared {
    fn is_stale(&self, captured: u64) -> bool {
        captured != self.generation.load(Ordering::SeqCst)
            || captured != self.registry.current_generation()
    }

    /// Added elements that are, or contain, a content tile.
    fn tiles_in(&self, batch: &MutationBatch) -> Vec<ElementRef> {
        let mut seen = HashSet::new();
        batch
            .iter()
            .flat_map(|record| record.added.iter())
            .filter(|element| {
                self.tile_classes
                    .iter()
                    .any(|class| element.contains_class(class))
            })
            .filter(|element| seen.insert(element.id()))
            .cloned()
            .collect()
    }
}

struct ActiveObservation {
    generation: u64,
    shutdown: CancellationToken,
    body_subscription: Arc<dyn SubscriptionHandle>,
    mutation_task: JoinHandle<()>,
    poll_task: JoinHandle<()>,
}

impl ActiveObservation {
    fn stop(self) {
        self.shutdown.cancel();
        self.body_subscription.disconnect();
        // Both loops exit on cancellation; dropping the handles detaches them.
        drop(self.mutation_task);
        drop(self.poll_task);
    }
}

/// Owns the body mutation subscription, the location poller, and the
/// per-anchor tile observers.
pub struct ObserverLifecycle {
    shared: Arc<ObserverShared>,
    active: Mutex<Option<ActiveObservation>>,
    tiles: TileObservers,
}

impl ObserverLifecycle {
    pub fn new(params: ObserverParams) -> Self {
        let ObserverParams {
            document,
            registry,
            telemetry,
            callbacks,
            tile_classes,
            url_poll_interval,
        } = params;

        let generation = registry.current_generation();
        Self {
            shared: Arc::new(ObserverShared {
                document,
                registry,
                telemetry,
                callbacks: Arc::new(CallbackSlot::new(callbacks)),
                tile_classes,
                url_poll_interval,
                generation: AtomicU64::new(generation),
            }),
            active: Mutex::new(None),
            tiles: TileObservers::default(),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveObservation>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts observing under `generation`, stopping any previous observation
    /// first. `generation` should be the registry's current generation; a
    /// mismatch makes every mutation batch stale.
    pub fn start(&self, generation: u64) -> Result<()> {
        let mut active = self.active();
        if let Some(previous) = active.take() {
            previous.stop();
        }
        self.shared.generation.store(generation, Ordering::SeqCst);

        let body = self.shared.document.body();
        let subscription = self
            .shared
            .document
            .observe(&body, ObserveOptions::child_subtree())
            .context("failed to observe document body")?;

        let shutdown = CancellationToken::new();
        let body_subscription = subscription.handle();
        let mutation_task = tokio::spawn(run_mutation_loop(
            Arc::clone(&self.shared),
            generation,
            subscription,
            shutdown.clone(),
        ));
        let poll_task = spawn_location_poller(
            Arc::clone(&self.shared.document),
            Arc::clone(&self.shared.callbacks),
            self.shared.url_poll_interval,
            shutdown.clone(),
        );

        *active = Some(ActiveObservation {
            generation,
            shutdown,
            body_subscription,
            mutation_task,
            poll_task,
        });
        tracing::debug!(target: "overlay_sync::observer", generation, "observers started");
        Ok(())
    }

    /// Disconnects every subscription and cancels polling. Safe to call when
    /// already stopped.
    pub fn stop(&self) {
        let previous = self.active().take();
        let tiles = self.tiles.disconnect_all();
        if let Some(previous) = previous {
            let generation = previous.generation;
            previous.stop();
            tracing::debug!(
                target: "overlay_sync::observer",
                generation,
                tiles,
                "observers stopped"
            );
        }
    }

    pub fn set_callbacks(&self, callbacks: Arc<dyn ObserverCallbacks>) {
        self.shared.callbacks.replace(callbacks);
    }

    pub fn is_running(&self) -> bool {
        self.active().is_some()
    }

    /// Generation the observers were last started under.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Watches one content anchor for attribute and subtree changes. Replaces
    /// any observer already attached to the same element.
    pub fn observe_tile(&self, element: &ElementRef, callback: TileCallback) -> Result<()> {
        self.tiles.observe(&self.shared.document, element, callback)
    }

    pub fn disconnect_tile_observer(&self, element: &ElementRef) -> bool {
        self.disconnect_tile_observer_by_id(element.id())
    }

    pub fn disconnect_tile_observer_by_id(&self, element: ElementId) -> bool {
        self.tiles.disconnect(element)
    }

    pub fn tile_observer_count(&self) -> usize {
        self.tiles.len()
    }

    /// Disconnects tile observers whose element is gone or detached.
    pub fn prune_tile_observers(&self) -> usize {
        self.tiles.prune()
    }
}

impl Drop for ObserverLifecycle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_mutation_loop(
    shared: Arc<ObserverShared>,
    generation: u64,
    mut subscription: MutationSubscription,
    shutdown: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = subscription.next_batch() => batch,
        };
        let Some(batch) = batch else {
            break;
        };

        if shared.is_stale(generation) {
            subscription.disconnect();
            shared.telemetry.record_stale_observer_disconnect();
            tracing::debug!(
                target: "overlay_sync::observer",
                generation,
                live_generation = shared.generation.load(Ordering::SeqCst),
                registry_generation = shared.registry.current_generation(),
                "stale mutation observer disconnected itself"
            );
            break;
        }

        let tiles = shared.tiles_in(&batch);
        if tiles.is_empty() {
            continue;
        }
        tracing::trace!(
            target: "overlay_sync::observer",
            generation,
            tiles = tiles.len(),
            "content tiles added"
        );
        let callbacks = shared.callbacks.get();
        invoke_guarded("on_dom_mutation", || callbacks.on_dom_mutation(tiles));
    }
}
