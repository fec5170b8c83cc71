use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use overlay_sync::{Engine, MemoryDocument, NavigationOutcome, NoopHooks};
use tokio::time::sleep;

use crate::support::helpers::{
    engine_with, init_tracing, test_config, wait_for_generation, wait_until, CountingCallbacks,
    EnhancingHooks, HookEvent,
};
use crate::support::page::{self, ANNOTATION_MARKER};

const TIMEOUT: Duration = Duration::from_secs(5);

fn browse_page() -> MemoryDocument {
    let document = MemoryDocument::new("https://www.example.com/browse");
    page::populate_row(&document, 70_000_000, 6);
    document
}

#[tokio::test]
async fn every_navigation_advances_the_generation_by_one() {
    init_tracing();
    let document = browse_page();
    let engine = engine_with(&document, test_config());
    let hooks = EnhancingHooks::install(&document, &engine);
    engine.start().unwrap();

    for step in 1..=5u64 {
        document.push_state(
            format!("https://www.example.com/browse/genre/{step}"),
            "locationchange",
        );
        wait_for_generation(&engine, step, TIMEOUT).await.unwrap();
    }

    let generations: Vec<u64> = hooks
        .completions()
        .into_iter()
        .map(|(_, generation)| generation)
        .collect();
    assert_eq!(generations, vec![1, 2, 3, 4, 5]);
    assert_eq!(engine.telemetry().snapshot().navigations_completed, 5);
    engine.stop().await;
}

#[tokio::test]
async fn both_navigation_events_for_one_push_run_a_single_cycle() {
    init_tracing();
    let document = browse_page();
    let engine = engine_with(&document, test_config());
    let hooks = EnhancingHooks::install(&document, &engine);
    hooks.delay_completion(Duration::from_millis(50));
    engine.start().unwrap();

    document.push_state("https://www.example.com/title/80057281", "popstate");
    document.dispatch_event("locationchange");
    wait_for_generation(&engine, 1, TIMEOUT).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(engine.current_generation(), 1);
    assert_eq!(hooks.completions().len(), 1);
    assert!(!engine.is_navigating());
    engine.stop().await;
}

#[tokio::test]
async fn hooks_observe_each_phase_in_order() {
    init_tracing();
    let document = browse_page();
    let engine = engine_with(&document, test_config());
    let hooks = EnhancingHooks::install(&document, &engine);
    let initial = page::annotate_all(&document, engine.registry());
    engine.start().unwrap();

    let outcome = engine.force_navigation().await;

    assert_eq!(outcome, NavigationOutcome::Completed { generation: 1 });
    assert_eq!(
        hooks.events(),
        vec![
            HookEvent::BeforeCleanup { overlays: initial },
            HookEvent::AfterCleanup {
                overlays: 0,
                markers: 0,
                observing: false,
            },
            HookEvent::Complete {
                url: "https://www.example.com/browse".to_owned(),
                generation: 1,
                observing: true,
            },
        ]
    );
    engine.stop().await;
}

#[tokio::test]
async fn re_enhancement_tracks_the_new_generation_only() {
    init_tracing();
    let document = browse_page();
    let engine = engine_with(&document, test_config());
    EnhancingHooks::install(&document, &engine);
    let tiles = page::annotate_all(&document, engine.registry());
    engine.start().unwrap();

    document.push_state("https://www.example.com/browse/my-list", "popstate");
    wait_for_generation(&engine, 1, TIMEOUT).await.unwrap();

    let snapshots = engine.registry().snapshots();
    assert_eq!(snapshots.len(), tiles);
    assert!(snapshots.iter().all(|snapshot| snapshot.generation == 1));
    assert_eq!(document.count_with_attribute(ANNOTATION_MARKER), tiles);
    engine.stop().await;
}

#[tokio::test]
async fn silent_url_changes_are_caught_by_the_poller() {
    init_tracing();
    let document = browse_page();
    let callbacks = Arc::new(CountingCallbacks::default());
    let engine = Engine::new(
        test_config(),
        document.shared(),
        Arc::new(NoopHooks),
        callbacks.clone(),
    );
    engine.start().unwrap();

    document.set_location("https://www.example.com/search?q=heist");
    wait_for_generation(&engine, 1, TIMEOUT).await.unwrap();

    let changes = callbacks.url_changes.lock().unwrap().clone();
    assert_eq!(
        changes.first(),
        Some(&(
            "https://www.example.com/search?q=heist".to_owned(),
            "https://www.example.com/browse".to_owned(),
        ))
    );
    engine.stop().await;
}

#[tokio::test]
async fn a_failing_hook_does_not_block_the_cycle() {
    init_tracing();
    let document = browse_page();
    let engine = engine_with(&document, test_config());
    let hooks = EnhancingHooks::install(&document, &engine);
    hooks.fail_before_cleanup();
    page::annotate_all(&document, engine.registry());
    engine.start().unwrap();

    document.push_state("https://www.example.com/latest", "locationchange");
    wait_for_generation(&engine, 1, TIMEOUT).await.unwrap();

    assert_eq!(hooks.completions().len(), 1);
    assert_eq!(engine.telemetry().snapshot().hook_failures, 1);

    document.push_state("https://www.example.com/browse", "locationchange");
    wait_for_generation(&engine, 2, TIMEOUT).await.unwrap();
    assert_eq!(engine.telemetry().snapshot().hook_failures, 2);
    engine.stop().await;
}

#[tokio::test]
async fn observers_from_a_previous_generation_stay_silent() {
    init_tracing();
    let document = browse_page();
    let callbacks = Arc::new(CountingCallbacks::default());
    let engine = Engine::new(
        test_config(),
        document.shared(),
        Arc::new(NoopHooks),
        callbacks.clone(),
    );
    engine.start().unwrap();

    page::populate_row(&document, 80_000_000, 2);
    wait_until("first mutation delivered", TIMEOUT, || {
        callbacks.mutation_calls.load(Ordering::SeqCst) == 1
    })
    .await
    .unwrap();
    assert_eq!(callbacks.tiles_seen.load(Ordering::SeqCst), 2);

    // A generation bump without a restart leaves the running observer stale.
    engine.registry().bump_generation();
    page::populate_row(&document, 81_000_000, 3);
    wait_until("stale observer disconnected", TIMEOUT, || {
        engine.telemetry().stale_observer_disconnects() == 1
    })
    .await
    .unwrap();

    assert_eq!(callbacks.mutation_calls.load(Ordering::SeqCst), 1);
    assert_eq!(page::tiles(&document).len(), 11);
    engine.stop().await;
}

#[tokio::test]
async fn a_redirect_during_teardown_is_handled_once_the_cycle_ends() {
    init_tracing();
    let document = browse_page();
    let config = overlay_sync::EngineConfig::builder()
        .url_poll_interval(Duration::from_secs(60))
        .build()
        .unwrap();
    let engine = engine_with(&document, config);
    let hooks = EnhancingHooks::install(&document, &engine);
    hooks.redirect_during_cleanup("https://www.example.com/b");
    engine.start().unwrap();

    document.push_state("https://www.example.com/a", "popstate");
    wait_for_generation(&engine, 2, TIMEOUT).await.unwrap();

    assert_eq!(
        engine.navigation().last_location().as_deref(),
        Some("https://www.example.com/b")
    );
    let urls: Vec<String> = hooks.completions().into_iter().map(|(url, _)| url).collect();
    assert_eq!(
        urls,
        vec![
            "https://www.example.com/a".to_owned(),
            "https://www.example.com/b".to_owned(),
        ]
    );
    assert!(engine.telemetry().snapshot().navigations_dropped >= 1);
    engine.stop().await;
}
