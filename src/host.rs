//! Host environment seam: elements, documents, mutation observation, and an
//! in-memory document used by tests and headless embedders.

pub mod document;
pub mod element;
pub mod memory;
pub mod mutation;
pub(crate) mod removal;

pub use document::{HostDocument, HostFuture, SharedDocument};
pub use element::{ElementId, ElementRef, HostElement, HostError, WeakElementRef};
pub use memory::{MemoryDocument, MemoryElement};
pub use mutation::{
    MutationBatch, MutationKind, MutationRecord, MutationSubscription, ObserveOptions,
    SubscriptionHandle,
};
pub use removal::RemovalSummary;
