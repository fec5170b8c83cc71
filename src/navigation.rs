//! Top-level controller that turns navigation signals into one atomic
//! cleanup, generation bump, and observer restart.

pub mod hooks;
pub mod orchestrator;
mod source;

pub use hooks::{HookError, HookFuture, HookStage, NavigationHooks, NoopHooks};
pub use orchestrator::{NavigationOrchestrator, NavigationOutcome, NavigationParams};
pub use source::NavigationSource;
