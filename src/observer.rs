//! Mutation observation and location polling, stamped with the generation
//! they were started under.

pub mod callbacks;
pub mod lifecycle;
mod poll;
mod tiles;

pub use callbacks::{NoopCallbacks, ObserverCallbacks, TileCallback};
pub use lifecycle::{ObserverLifecycle, ObserverParams};
