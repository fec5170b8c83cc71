//! Ordered teardown of everything the engine put into the document.

pub mod orchestrator;
mod report;
mod sweep;

pub use orchestrator::{CleanupOrchestrator, CleanupParams};
pub use report::CleanupReport;
