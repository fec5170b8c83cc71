use crate::host::removal::{RemovalSummary, RemovalTally};
use crate::host::{ElementRef, HostDocument};

/// Applies per-element host operations in fixed-size batches, handing control
/// back to the host after every batch.
pub(crate) struct BatchSweep<'a> {
    document: &'a dyn HostDocument,
    batch_size: usize,
    yields: usize,
}

impl<'a> BatchSweep<'a> {
    pub(crate) fn new(document: &'a dyn HostDocument, batch_size: usize) -> Self {
        Self {
            document,
            batch_size: batch_size.max(1),
            yields: 0,
        }
    }

    pub(crate) fn yields(&self) -> usize {
        self.yields
    }

    /// Removes every still-connected element.
    pub(crate) async fn remove(
        &mut self,
        operation: &'static str,
        elements: &[ElementRef],
    ) -> RemovalSummary {
        let mut tally = RemovalTally::new(operation);
        for batch in elements.chunks(self.batch_size) {
            for element in batch.iter().filter(|element| element.is_connected()) {
                tally.record(element.remove());
            }
            self.yield_to_host().await;
        }
        tally.finish()
    }

    /// Strips `attribute` from every element.
    pub(crate) async fn clear_attribute(
        &mut self,
        operation: &'static str,
        elements: &[ElementRef],
        attribute: &str,
    ) -> RemovalSummary {
        let mut tally = RemovalTally::new(operation);
        for batch in elements.chunks(self.batch_size) {
            for element in batch {
                tally.record(element.remove_attribute(attribute));
            }
            self.yield_to_host().await;
        }
        tally.finish()
    }

    async fn yield_to_host(&mut self) {
        self.document.yield_to_host().await;
        self.yields += 1;
    }
}
