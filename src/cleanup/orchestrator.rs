use super::report::CleanupReport;
use super::sweep::BatchSweep;
use crate::host::removal::RemovalTally;
use crate::host::{ElementRef, SharedDocument};
use crate::observer::ObserverLifecycle;
use crate::runtime::telemetry::Telemetry;
use crate::state::{Annotation, StateRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct CleanupParams {
    pub document: SharedDocument,
    pub registry: Arc<StateRegistry>,
    pub observers: Arc<ObserverLifecycle>,
    pub telemetry: Arc<Telemetry>,
    pub annotation_marker: String,
    pub auxiliary_marker: String,
    pub batch_size: usize,
    pub alternate_paths: Vec<String>,
}

/// Tears down observers, rendered elements, registry state, and stray markers
/// in a fixed order.
///
/// Every pass holds an async mutex for its whole duration, so two callers
/// never interleave their batches; a pass that waited simply finds the
/// document already clean.
pub struct CleanupOrchestrator {
    document: SharedDocument,
    registry: Arc<StateRegistry>,
    observers: Arc<ObserverLifecycle>,
    telemetry: Arc<Telemetry>,
    annotation_marker: String,
    auxiliary_marker: String,
    batch_size: usize,
    alternate_paths: Vec<String>,
    serial: Mutex<()>,
}

impl CleanupOrchestrator {
    pub fn new(params: CleanupParams) -> Self {
        let CleanupParams {
            document,
            registry,
            observers,
            telemetry,
            annotation_marker,
            auxiliary_marker,
            batch_size,
            alternate_paths,
        } = params;

        Self {
            document,
            registry,
            observers,
            telemetry,
            annotation_marker,
            auxiliary_marker,
            batch_size: batch_size.max(1),
            alternate_paths,
            serial: Mutex::new(()),
        }
    }

    /// Full teardown: stop observers, remove tracked and stray annotation
    /// elements, reset the registry, then clear auxiliary markers.
    pub async fn cleanup(&self) -> CleanupReport {
        let _serial = self.serial.lock().await;

        self.observers.stop();
        let report = self.purge_document().await;
        self.finish("cleanup", report)
    }

    /// Removes rendered elements and clears annotations while observers keep
    /// running.
    pub async fn soft_cleanup(&self) -> CleanupReport {
        let _serial = self.serial.lock().await;

        let mut report = CleanupReport::default();
        let mut sweep = BatchSweep::new(self.document.as_ref(), self.batch_size);
        let tracked = elements_of(self.registry.take_annotations());
        report.absorb_tracked(sweep.remove("soft cleanup", &tracked).await);
        report.yields = sweep.yields();

        self.finish("soft cleanup", report)
    }

    /// Runs a full removal, leaving observers running, when `path` belongs to
    /// an alternate-presentation page. Returns `None` for ordinary pages.
    pub async fn cleanup_by_page_context(&self, path: &str) -> Option<CleanupReport> {
        if !self.is_alternate_context(path) {
            return None;
        }

        let _serial = self.serial.lock().await;
        tracing::debug!(target: "overlay_sync::cleanup", path, "alternate page context; removing overlays");
        let report = self.purge_document().await;
        Some(self.finish("page context cleanup", report))
    }

    /// Removes every annotation whose anchor has left the document, along with
    /// tile observers of detached anchors. Returns how many annotations went.
    pub fn cleanup_stale_overlays(&self) -> usize {
        let stale = self.registry.take_stale();
        let pruned_observers = self.observers.prune_tile_observers();
        if stale.is_empty() {
            return 0;
        }

        self.detach_untracked("stale overlay cleanup", &stale);
        tracing::debug!(
            target: "overlay_sync::cleanup",
            removed = stale.len(),
            pruned_observers,
            "removed overlays with detached anchors"
        );
        stale.len()
    }

    /// Removes overlays older than `max_age`. Returns how many left the registry.
    pub fn cleanup_expired_overlays(&self, max_age: Duration) -> usize {
        let expired = self.registry.take_expired(max_age);
        if expired.is_empty() {
            return 0;
        }

        self.detach_untracked("expired overlay cleanup", &expired);
        tracing::debug!(
            target: "overlay_sync::cleanup",
            removed = expired.len(),
            max_age_ms = max_age.as_millis() as u64,
            "removed overlays past their maximum age"
        );
        expired.len()
    }

    /// Detaches annotations already taken out of the registry and counts the
    /// outcome in telemetry.
    fn detach_untracked(&self, operation: &'static str, annotations: &[Annotation]) {
        let mut tally = RemovalTally::new(operation);
        for annotation in annotations {
            tally.record(annotation.detach());
        }
        let summary = tally.finish();
        self.telemetry.record_removals(summary.removed, summary.failures);
    }

    pub fn is_alternate_context(&self, path: &str) -> bool {
        self.alternate_paths.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    pub fn annotation_marker(&self) -> &str {
        &self.annotation_marker
    }

    pub fn auxiliary_marker(&self) -> &str {
        &self.auxiliary_marker
    }

    /// Steps shared by every full removal; the caller holds the serial lock.
    async fn purge_document(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut sweep = BatchSweep::new(self.document.as_ref(), self.batch_size);

        let tracked_ids = self.registry.tracked_element_ids();
        let tracked = elements_of(self.registry.take_annotations());
        report.absorb_tracked(sweep.remove("tracked overlay removal", &tracked).await);

        let strays: Vec<ElementRef> = self
            .document
            .query_attribute(&self.annotation_marker)
            .into_iter()
            .filter(|element| !tracked_ids.contains(&element.id()))
            .collect();
        if !strays.is_empty() {
            tracing::debug!(
                target: "overlay_sync::cleanup",
                strays = strays.len(),
                "removing untracked annotation elements"
            );
        }
        report.absorb_strays(sweep.remove("stray overlay sweep", &strays).await);

        report.absorb_tracked(self.registry.reset());

        let marked = self.document.query_attribute(&self.auxiliary_marker);
        report.absorb_markers(
            sweep
                .clear_attribute("auxiliary marker sweep", &marked, &self.auxiliary_marker)
                .await,
        );

        report.yields = sweep.yields();
        report
    }

    fn finish(&self, operation: &'static str, report: CleanupReport) -> CleanupReport {
        self.telemetry.record_cleanup();
        self.telemetry
            .record_removals(report.total_removed(), report.failures);
        tracing::debug!(
            target: "overlay_sync::cleanup",
            operation,
            tracked = report.tracked_removed,
            strays = report.strays_removed,
            markers = report.markers_cleared,
            failures = report.failures,
            yields = report.yields,
            "cleanup finished"
        );
        report
    }
}

fn elements_of(annotations: Vec<Annotation>) -> Vec<ElementRef> {
    annotations.into_iter().map(Annotation::into_element).collect()
}
