use crate::host::{ElementRef, MutationBatch};
use crate::runtime::panic::panic_message;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

/// Receiver of everything the observers notice.
///
/// Both methods default to no-ops so implementors only override what they
/// care about. Callbacks run on the observer task and must not block.
pub trait ObserverCallbacks: Send + Sync {
    /// Newly added elements that look like content tiles.
    fn on_dom_mutation(&self, _tiles: Vec<ElementRef>) {}

    fn on_url_change(&self, _new_url: &str, _old_url: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl ObserverCallbacks for NoopCallbacks {}

/// Invoked with the observed anchor and the batch that touched it.
pub type TileCallback = Arc<dyn Fn(&ElementRef, &MutationBatch) + Send + Sync>;

/// Replaceable callback set shared by every observer task.
pub(crate) struct CallbackSlot {
    current: RwLock<Arc<dyn ObserverCallbacks>>,
}

impl CallbackSlot {
    pub(crate) fn new(callbacks: Arc<dyn ObserverCallbacks>) -> Self {
        Self {
            current: RwLock::new(callbacks),
        }
    }

    pub(crate) fn get(&self) -> Arc<dyn ObserverCallbacks> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn replace(&self, callbacks: Arc<dyn ObserverCallbacks>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = callbacks;
    }
}

/// Runs a caller-supplied callback, logging instead of unwinding into the
/// observer task. Returns whether the callback completed.
pub(crate) fn invoke_guarded(callback: &'static str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            tracing::error!(
                callback,
                panic = %panic_message(panic.as_ref()),
                "observer callback panicked"
            );
            false
        }
    }
}
