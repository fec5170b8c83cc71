use crate::host::RemovalSummary;

/// What one cleanup pass did to the document.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Rendered elements owned by tracked annotations.
    pub tracked_removed: usize,
    /// Marked elements the registry did not know about.
    pub strays_removed: usize,
    /// Elements whose auxiliary marker attribute was cleared.
    pub markers_cleared: usize,
    pub failures: usize,
    pub yields: usize,
}

impl CleanupReport {
    pub fn total_removed(&self) -> usize {
        self.tracked_removed + self.strays_removed
    }

    /// Whether the pass found nothing to do.
    pub fn is_noop(&self) -> bool {
        self.total_removed() == 0 && self.markers_cleared == 0 && self.failures == 0
    }

    pub(crate) fn absorb_tracked(&mut self, summary: RemovalSummary) {
        self.tracked_removed += summary.removed;
        self.failures += summary.failures;
    }

    pub(crate) fn absorb_strays(&mut self, summary: RemovalSummary) {
        self.strays_removed += summary.removed;
        self.failures += summary.failures;
    }

    pub(crate) fn absorb_markers(&mut self, summary: RemovalSummary) {
        self.markers_cleared += summary.removed;
        self.failures += summary.failures;
    }
}
