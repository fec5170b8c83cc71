use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;

pub type HookFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Enumerates the points in a navigation cycle where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeCleanup,
    AfterCleanup,
    NavigationComplete,
}

/// A hook failure tagged with the stage it happened in. Never fatal: the
/// navigation cycle logs it and carries on.
#[derive(Debug)]
pub struct HookError {
    stage: HookStage,
    source: AnyError,
}

impl HookError {
    pub fn new(stage: HookStage, source: AnyError) -> Self {
        Self { stage, source }
    }

    pub fn stage(&self) -> HookStage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for HookError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} hook failed: {}", self.stage, self.source)
    }
}

impl std::error::Error for HookError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Caller-supplied hooks awaited during every navigation cycle.
///
/// `on_navigation_complete` is where re-enhancement happens: it receives the
/// new location after the generation was bumped and observers restarted, and
/// is expected to repopulate the registry.
pub trait NavigationHooks: Send + Sync + 'static {
    fn on_before_cleanup(&self) -> HookFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    fn on_after_cleanup(&self) -> HookFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    fn on_navigation_complete<'a>(&'a self, _url: &'a str) -> HookFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl NavigationHooks for NoopHooks {}
