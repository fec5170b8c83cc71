use super::callbacks::{invoke_guarded, TileCallback};
use crate::host::{
    ElementId, ElementRef, MutationSubscription, ObserveOptions, SharedDocument,
    SubscriptionHandle, WeakElementRef,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

struct TileEntry {
    ticket: u64,
    element: WeakElementRef,
    subscription: Arc<dyn SubscriptionHandle>,
    task: JoinHandle<()>,
}

impl TileEntry {
    fn disconnect(self) {
        self.subscription.disconnect();
        self.task.abort();
    }

    fn is_live(&self) -> bool {
        self.subscription.is_connected()
            && self
                .element
                .upgrade()
                .map(|element| element.is_connected())
                .unwrap_or(false)
    }
}

#[derive(Default)]
struct TileState {
    next_ticket: u64,
    entries: HashMap<ElementId, TileEntry>,
}

/// Per-anchor observations, keyed by element id and holding the element weakly.
#[derive(Clone, Default)]
pub(crate) struct TileObservers {
    state: Arc<Mutex<TileState>>,
}

impl TileObservers {
    fn state(&self) -> MutexGuard<'_, TileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn observe(
        &self,
        document: &SharedDocument,
        element: &ElementRef,
        callback: TileCallback,
    ) -> Result<()> {
        let element_id = element.id();
        let subscription = document
            .observe(element, ObserveOptions::anchor())
            .with_context(|| format!("failed to observe tile {element_id}"))?;

        let mut state = self.state();
        if let Some(previous) = state.entries.remove(&element_id) {
            previous.disconnect();
        }
        let ticket = state.next_ticket;
        state.next_ticket = state.next_ticket.wrapping_add(1);

        let handle = subscription.handle();
        let weak = Arc::downgrade(element);
        let task = tokio::spawn(run_tile_loop(
            self.clone(),
            element_id,
            ticket,
            weak.clone(),
            subscription,
            callback,
        ));
        state.entries.insert(
            element_id,
            TileEntry {
                ticket,
                element: weak,
                subscription: handle,
                task,
            },
        );
        Ok(())
    }

    pub(crate) fn disconnect(&self, element: ElementId) -> bool {
        let entry = self.state().entries.remove(&element);
        match entry {
            Some(entry) => {
                entry.disconnect();
                true
            }
            None => false,
        }
    }

    pub(crate) fn disconnect_all(&self) -> usize {
        let entries: Vec<TileEntry> = self.state().entries.drain().map(|(_, entry)| entry).collect();
        let count = entries.len();
        for entry in entries {
            entry.disconnect();
        }
        count
    }

    /// Disconnects observers whose element is gone or detached.
    pub(crate) fn prune(&self) -> usize {
        let dead: Vec<TileEntry> = {
            let mut state = self.state();
            let ids: Vec<ElementId> = state
                .entries
                .iter()
                .filter(|(_, entry)| !entry.is_live())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.entries.remove(&id))
                .collect()
        };
        let count = dead.len();
        for entry in dead {
            entry.disconnect();
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.state().entries.len()
    }

    fn forget(&self, element: ElementId, ticket: u64) {
        let mut state = self.state();
        if state
            .entries
            .get(&element)
            .is_some_and(|entry| entry.ticket == ticket)
        {
            state.entries.remove(&element);
        }
    }
}

async fn run_tile_loop(
    observers: TileObservers,
    element_id: ElementId,
    ticket: u64,
    element: WeakElementRef,
    mut subscription: MutationSubscription,
    callback: TileCallback,
) {
    while let Some(batch) = subscription.next_batch().await {
        let Some(anchor) = element.upgrade().filter(|anchor| anchor.is_connected()) else {
            tracing::trace!(
                target: "overlay_sync::observer",
                element = %element_id,
                "tile detached; disconnecting its observer"
            );
            subscription.disconnect();
            break;
        };
        invoke_guarded("tile_callback", || callback(&anchor, &batch));
    }
    observers.forget(element_id, ticket);
}
