use super::element::HostError;

/// Outcome of a best-effort batch of element removals.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemovalSummary {
    pub removed: usize,
    pub failures: usize,
}

impl RemovalSummary {
    pub fn merge(&mut self, other: RemovalSummary) {
        self.removed = self.removed.saturating_add(other.removed);
        self.failures = self.failures.saturating_add(other.failures);
    }
}

/// Counts per-element failures so an operation logs once instead of once per element.
pub(crate) struct RemovalTally {
    operation: &'static str,
    summary: RemovalSummary,
    first_error: Option<HostError>,
}

impl RemovalTally {
    pub(crate) fn new(operation: &'static str) -> Self {
        Self {
            operation,
            summary: RemovalSummary::default(),
            first_error: None,
        }
    }

    pub(crate) fn record(&mut self, result: Result<(), HostError>) {
        match result {
            Ok(()) => self.summary.removed += 1,
            Err(err) => {
                self.summary.failures += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(err);
                }
            }
        }
    }

    pub(crate) fn finish(self) -> RemovalSummary {
        if let Some(err) = self.first_error {
            tracing::warn!(
                operation = self.operation,
                removed = self.summary.removed,
                failures = self.summary.failures,
                first_error = %err,
                "some host operations failed; continuing"
            );
        }
        self.summary
    }
}
