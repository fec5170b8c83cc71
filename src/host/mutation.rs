use super::element::{ElementId, ElementRef};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Subset of mutation-observer options the engine relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObserveOptions {
    pub child_list: bool,
    pub attributes: bool,
    pub subtree: bool,
}

impl ObserveOptions {
    /// Child additions anywhere below the target. Used for the document body.
    pub const fn child_subtree() -> Self {
        Self {
            child_list: true,
            attributes: false,
            subtree: true,
        }
    }

    /// Attribute and structural changes below a single content anchor.
    pub const fn anchor() -> Self {
        Self {
            child_list: true,
            attributes: true,
            subtree: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    Attributes { name: String },
}

#[derive(Clone)]
pub struct MutationRecord {
    pub target: ElementId,
    pub kind: MutationKind,
    pub added: Vec<ElementRef>,
    pub removed: Vec<ElementId>,
}

impl fmt::Debug for MutationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let added: Vec<ElementId> = self.added.iter().map(|element| element.id()).collect();
        f.debug_struct("MutationRecord")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("added", &added)
            .field("removed", &self.removed)
            .finish()
    }
}

pub type MutationBatch = Vec<MutationRecord>;

/// Disconnect side of a host observation. Disconnecting twice is harmless.
pub trait SubscriptionHandle: Send + Sync {
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// A live mutation observation: batches arrive on the receiver until the
/// handle disconnects. Dropping the subscription disconnects it.
pub struct MutationSubscription {
    receiver: mpsc::UnboundedReceiver<MutationBatch>,
    handle: Arc<dyn SubscriptionHandle>,
}

impl MutationSubscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<MutationBatch>,
        handle: Arc<dyn SubscriptionHandle>,
    ) -> Self {
        Self { receiver, handle }
    }

    /// Waits for the next batch. Returns `None` once the subscription has been
    /// disconnected and every buffered batch was consumed.
    pub async fn next_batch(&mut self) -> Option<MutationBatch> {
        if !self.handle.is_connected() {
            return None;
        }
        self.receiver.recv().await
    }

    pub fn handle(&self) -> Arc<dyn SubscriptionHandle> {
        Arc::clone(&self.handle)
    }

    pub fn disconnect(&self) {
        self.handle.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }
}

impl Drop for MutationSubscription {
    fn drop(&mut self) {
        self.handle.disconnect();
    }
}
