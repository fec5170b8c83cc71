use std::time::Duration;

use overlay_sync::{EngineConfig, HostElement, MemoryDocument};
use tokio::time::sleep;

use crate::support::helpers::{engine_with, init_tracing, test_config};
use crate::support::page::{self, ANNOTATION_MARKER, AUXILIARY_MARKER};

#[tokio::test]
async fn repeated_cleanup_converges_to_the_same_empty_state() {
    init_tracing();
    let document = MemoryDocument::new("https://www.example.com/browse");
    page::populate_row(&document, 70_000_000, 8);
    let engine = engine_with(&document, test_config());
    page::annotate_all(&document, engine.registry());
    page::add_stray(&document);
    page::add_stray(&document);
    engine.start().unwrap();

    let first = engine.cleanup().await;
    assert_eq!(first.tracked_removed, 8);
    assert_eq!(first.strays_removed, 2);
    assert_eq!(first.markers_cleared, 8);
    assert!(!engine.observers().is_running());

    let second = engine.cleanup().await;
    assert!(second.is_noop(), "second cleanup found work: {second:?}");
    assert!(engine.registry().is_empty());
    assert_eq!(document.count_with_attribute(ANNOTATION_MARKER), 0);
    assert_eq!(document.count_with_attribute(AUXILIARY_MARKER), 0);

    engine.restart_observers().unwrap();
    assert!(engine.observers().is_running());
    engine.stop().await;
}

#[tokio::test]
async fn large_pages_are_torn_down_in_bounded_batches() {
    init_tracing();
    let document = MemoryDocument::new("https://www.example.com/browse");
    for row in 0..10u64 {
        page::populate_row(&document, 10_000_000 * (row + 1), 100);
    }
    let engine = engine_with(&document, test_config());
    assert_eq!(page::annotate_all(&document, engine.registry()), 1000);
    engine.start().unwrap();
    document.reset_yield_stats();

    document.push_state("https://www.example.com/browse/originals", "locationchange");
    crate::support::helpers::wait_for_generation(&engine, 1, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(document.count_with_attribute(ANNOTATION_MARKER), 0);
    assert!(engine.registry().is_empty());
    assert!(
        document.max_removals_between_yields() <= engine.config().cleanup_batch_size(),
        "{} removals ran without yielding",
        document.max_removals_between_yields()
    );
    assert!(document.yield_count() >= 50);
    engine.stop().await;
}

#[tokio::test]
async fn alternate_presentations_are_cleared_by_page_context() {
    init_tracing();
    let document = MemoryDocument::new("https://www.example.com/browse");
    page::populate_row(&document, 70_000_000, 3);
    let engine = engine_with(&document, test_config());
    page::annotate_all(&document, engine.registry());

    assert!(engine.cleanup_by_page_context().await.is_none());
    assert_eq!(engine.overlay_count(), 3);

    document.set_location("https://www.example.com/watch/80100172");
    let report = engine
        .cleanup_by_page_context()
        .await
        .expect("watch pages are an alternate context");
    assert_eq!(report.tracked_removed, 3);
    assert_eq!(engine.overlay_count(), 0);
}

#[tokio::test]
async fn annotations_on_removed_tiles_are_pruned() {
    init_tracing();
    let document = MemoryDocument::new("https://www.example.com/browse");
    let tiles = page::populate_row(&document, 70_000_000, 4);
    let engine = engine_with(&document, test_config());
    page::annotate_all(&document, engine.registry());

    tiles[1].remove().unwrap();
    tiles[2].remove().unwrap();

    assert_eq!(engine.prune_expired(), 2);
    assert_eq!(engine.overlay_count(), 2);
    assert_eq!(engine.prune_expired(), 0);
}

#[tokio::test(start_paused = true)]
async fn hygiene_loop_expires_old_annotations() {
    init_tracing();
    let document = MemoryDocument::new("https://www.example.com/browse");
    page::populate_row(&document, 70_000_000, 5);
    let config = EngineConfig::builder()
        .annotation_max_age(Duration::from_secs(5))
        .hygiene_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let engine = engine_with(&document, config);
    page::annotate_all(&document, engine.registry());
    engine.start().unwrap();

    sleep(Duration::from_secs(3)).await;
    assert_eq!(engine.overlay_count(), 5);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.overlay_count(), 0);
    assert_eq!(document.count_with_attribute(ANNOTATION_MARKER), 0);
    assert_eq!(engine.telemetry().snapshot().elements_removed, 5);
    engine.stop().await;
}
