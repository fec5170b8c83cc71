pub mod cache;
pub mod cleanup;
pub mod host;
pub mod navigation;
pub mod observer;
pub mod runtime;
pub mod scheduler;
pub mod state;

pub use cache::{resolve_with_timeout, CacheLookup, MemoryTargetCache, TargetCache};
pub use cleanup::{CleanupOrchestrator, CleanupReport};
pub use host::{
    ElementId, ElementRef, HostDocument, HostElement, HostError, MemoryDocument, SharedDocument,
};
pub use navigation::{
    HookError, HookFuture, HookStage, NavigationHooks, NavigationOrchestrator, NavigationOutcome,
    NavigationSource, NoopHooks,
};
pub use observer::{NoopCallbacks, ObserverCallbacks, ObserverLifecycle, TileCallback};
pub use runtime::config::{EngineConfig, EngineConfigBuilder, EngineConfigParams};
pub use runtime::engine::Engine;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use scheduler::{TaskPriority, TaskScheduler, TaskWork};
pub use state::{Annotation, AnnotationSnapshot, ContentId, ResolvedTarget, StateRegistry};
