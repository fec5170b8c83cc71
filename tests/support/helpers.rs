use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use overlay_sync::{
    ElementRef, Engine, EngineConfig, HookFuture, MemoryDocument, NavigationHooks, NoopCallbacks,
    NoopHooks, ObserverCallbacks, ObserverLifecycle, StateRegistry,
};
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

use super::page::{self, ANNOTATION_MARKER};

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn test_config() -> EngineConfig {
    EngineConfig::builder()
        .url_poll_interval(Duration::from_millis(20))
        .build()
        .expect("test config is valid")
}

pub fn engine_with(document: &MemoryDocument, config: EngineConfig) -> Engine {
    Engine::new(
        config,
        document.shared(),
        Arc::new(NoopHooks),
        Arc::new(NoopCallbacks),
    )
}

/// What a hook saw when it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    BeforeCleanup { overlays: usize },
    AfterCleanup { overlays: usize, markers: usize, observing: bool },
    Complete { url: String, generation: u64, observing: bool },
}

/// Hooks that record engine state at every stage and re-annotate the page
/// once a navigation completes, the way a real enhancer would.
pub struct EnhancingHooks {
    document: MemoryDocument,
    registry: Arc<StateRegistry>,
    observers: Arc<ObserverLifecycle>,
    events: Mutex<Vec<HookEvent>>,
    fail_before: AtomicBool,
    complete_delay: Mutex<Option<Duration>>,
    redirect: Mutex<Option<String>>,
}

impl EnhancingHooks {
    pub fn install(document: &MemoryDocument, engine: &Engine) -> Arc<Self> {
        let hooks = Arc::new(Self {
            document: document.clone(),
            registry: Arc::clone(engine.registry()),
            observers: Arc::clone(engine.observers()),
            events: Mutex::new(Vec::new()),
            fail_before: AtomicBool::new(false),
            complete_delay: Mutex::new(None),
            redirect: Mutex::new(None),
        });
        engine.navigation().set_hooks(hooks.clone());
        hooks
    }

    pub fn fail_before_cleanup(&self) {
        self.fail_before.store(true, Ordering::SeqCst);
    }

    pub fn delay_completion(&self, delay: Duration) {
        *self.complete_delay.lock().unwrap() = Some(delay);
    }

    /// Makes the next before-cleanup hook push `location`, as a router
    /// redirect landing mid-teardown would.
    pub fn redirect_during_cleanup(&self, location: impl Into<String>) {
        *self.redirect.lock().unwrap() = Some(location.into());
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<(String, u64)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HookEvent::Complete { url, generation, .. } => Some((url, generation)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: HookEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl NavigationHooks for EnhancingHooks {
    fn on_before_cleanup(&self) -> HookFuture<'_> {
        Box::pin(async move {
            self.record(HookEvent::BeforeCleanup {
                overlays: self.registry.len(),
            });
            let redirect = self.redirect.lock().unwrap().take();
            if let Some(location) = redirect {
                self.document.push_state(location, "popstate");
                sleep(Duration::from_millis(20)).await;
            }
            if self.fail_before.load(Ordering::SeqCst) {
                bail!("before-cleanup hook failed");
            }
            Ok(())
        })
    }

    fn on_after_cleanup(&self) -> HookFuture<'_> {
        Box::pin(async move {
            self.record(HookEvent::AfterCleanup {
                overlays: self.registry.len(),
                markers: self.document.count_with_attribute(ANNOTATION_MARKER),
                observing: self.observers.is_running(),
            });
            Ok(())
        })
    }

    fn on_navigation_complete<'a>(&'a self, url: &'a str) -> HookFuture<'a> {
        Box::pin(async move {
            let delay = *self.complete_delay.lock().unwrap();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            self.record(HookEvent::Complete {
                url: url.to_owned(),
                generation: self.registry.current_generation(),
                observing: self.observers.is_running(),
            });
            page::annotate_all(&self.document, &self.registry);
            Ok(())
        })
    }
}

/// Observer callbacks that count what they are told.
#[derive(Default)]
pub struct CountingCallbacks {
    pub mutation_calls: AtomicUsize,
    pub tiles_seen: AtomicUsize,
    pub url_changes: Mutex<Vec<(String, String)>>,
}

impl ObserverCallbacks for CountingCallbacks {
    fn on_dom_mutation(&self, tiles: Vec<ElementRef>) {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        self.tiles_seen.fetch_add(tiles.len(), Ordering::SeqCst);
    }

    fn on_url_change(&self, new_url: &str, old_url: &str) {
        self.url_changes
            .lock()
            .unwrap()
            .push((new_url.to_owned(), old_url.to_owned()));
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until(
    what: &str,
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("condition '{what}' not reached within {timeout:?}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Waits until the engine reached `generation` and is idle again.
pub async fn wait_for_generation(engine: &Engine, generation: u64, timeout: Duration) -> Result<()> {
    wait_until(&format!("generation {generation}"), timeout, || {
        engine.current_generation() >= generation && !engine.is_navigating()
    })
    .await
}
