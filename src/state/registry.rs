//! Authoritative store of live annotations and the navigation generation.

use super::annotation::{AnchorPlacement, Annotation, AnnotationSnapshot, ContentId, ResolvedTarget};
use crate::host::removal::{RemovalSummary, RemovalTally};
use crate::host::ElementId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct RegistryState {
    annotations: HashMap<ContentId, Annotation>,
    placements: HashMap<ContentId, AnchorPlacement>,
    resolved: HashMap<ContentId, Option<ResolvedTarget>>,
}

/// Owns every live [`Annotation`] keyed by content identity, the ancillary
/// per-identity metadata, and the monotonic generation counter.
///
/// Elements are always detached outside the state lock so host callbacks can
/// never re-enter the registry while it is held.
#[derive(Default)]
pub struct StateRegistry {
    generation: AtomicU64,
    state: Mutex<RegistryState>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Advances the generation and purges annotations more than one epoch
    /// behind it. Entries from the previous generation survive so work that is
    /// still completing from that epoch is not thrown away.
    pub fn bump_generation(&self) -> u64 {
        let new_generation = self
            .generation
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);
        let floor = new_generation.saturating_sub(1);

        let purged: Vec<Annotation> = {
            let mut state = self.state();
            let stale: Vec<ContentId> = state
                .annotations
                .iter()
                .filter(|(_, annotation)| annotation.generation() < floor)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .iter()
                .filter_map(|id| state.annotations.remove(id))
                .collect()
        };

        let summary = detach_all("generation purge", &purged);
        tracing::debug!(
            generation = new_generation,
            purged = purged.len(),
            detach_failures = summary.failures,
            "bumped overlay generation"
        );
        new_generation
    }

    /// Stores `annotation` under `id`. An annotation already tracked for the
    /// same identity is detached and replaced.
    pub fn set_annotation(&self, id: ContentId, annotation: Annotation) {
        let replaced = self.state().annotations.insert(id.clone(), annotation);
        if let Some(previous) = replaced {
            if let Err(err) = previous.detach() {
                tracing::debug!(content = %id, error = %err, "failed to detach replaced annotation");
            }
        }
    }

    pub fn get_annotation(&self, id: &ContentId) -> Option<AnnotationSnapshot> {
        self.state()
            .annotations
            .get(id)
            .map(Annotation::snapshot)
    }

    pub fn has_annotation(&self, id: &ContentId) -> bool {
        self.state().annotations.contains_key(id)
    }

    /// Removes the annotation for `id`, detaching its element best-effort.
    /// Returns whether an annotation was tracked.
    pub fn remove_annotation(&self, id: &ContentId) -> bool {
        let removed = self.state().annotations.remove(id);
        match removed {
            Some(annotation) => {
                if let Err(err) = annotation.detach() {
                    tracing::debug!(content = %id, error = %err, "failed to detach removed annotation");
                }
                true
            }
            None => false,
        }
    }

    /// Detaches every owned element and empties the annotation map.
    pub fn clear_all(&self) -> RemovalSummary {
        let drained = self.take_annotations();
        detach_all("clear annotations", &drained)
    }

    /// Removes annotations older than `max_age`; returns how many were removed.
    pub fn prune_by_age(&self, max_age: Duration) -> usize {
        let expired = self.take_expired(max_age);
        if !expired.is_empty() {
            detach_all("age prune", &expired);
            tracing::debug!(
                removed = expired.len(),
                max_age_ms = max_age.as_millis() as u64,
                "pruned aged annotations"
            );
        }
        expired.len()
    }

    /// Clears annotations and every piece of ancillary metadata.
    pub fn reset(&self) -> RemovalSummary {
        let drained = {
            let mut state = self.state();
            state.placements.clear();
            state.resolved.clear();
            std::mem::take(&mut state.annotations)
        };
        let annotations: Vec<Annotation> = drained.into_values().collect();
        detach_all("registry reset", &annotations)
    }

    pub fn len(&self) -> usize {
        self.state().annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().annotations.is_empty()
    }

    pub fn ids(&self) -> Vec<ContentId> {
        let mut ids: Vec<ContentId> = self.state().annotations.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshots(&self) -> Vec<AnnotationSnapshot> {
        let mut snapshots: Vec<AnnotationSnapshot> = self
            .state()
            .annotations
            .values()
            .map(Annotation::snapshot)
            .collect();
        snapshots.sort_by(|left, right| left.id.cmp(&right.id));
        snapshots
    }

    /// Element ids of every rendered element currently owned by the registry.
    pub fn tracked_element_ids(&self) -> HashSet<ElementId> {
        self.state()
            .annotations
            .values()
            .map(Annotation::element_id)
            .collect()
    }

    /// Identities whose anchor is no longer attached to the document.
    pub fn stale_ids(&self) -> Vec<ContentId> {
        let mut ids: Vec<ContentId> = self
            .state()
            .annotations
            .iter()
            .filter(|(_, annotation)| !annotation.is_anchor_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn set_placement(&self, id: ContentId, placement: AnchorPlacement) {
        self.state().placements.insert(id, placement);
    }

    pub fn placement(&self, id: &ContentId) -> Option<AnchorPlacement> {
        self.state().placements.get(id).copied()
    }

    /// Records the resolution result for `id`; `None` records a known miss.
    pub fn set_resolved(&self, id: ContentId, target: Option<ResolvedTarget>) {
        self.state().resolved.insert(id, target);
    }

    /// `Some(None)` means the identity is known not to resolve.
    pub fn resolved(&self, id: &ContentId) -> Option<Option<ResolvedTarget>> {
        self.state().resolved.get(id).cloned()
    }

    /// Empties the annotation map without detaching anything; the caller
    /// becomes responsible for the returned elements.
    pub(crate) fn take_annotations(&self) -> Vec<Annotation> {
        let drained = std::mem::take(&mut self.state().annotations);
        drained.into_values().collect()
    }

    /// Removes and returns every annotation whose anchor has left the document.
    pub(crate) fn take_expired(&self, max_age: Duration) -> Vec<Annotation> {
        let mut state = self.state();
        let expired: Vec<ContentId> = state
            .annotations
            .iter()
            .filter(|(_, annotation)| annotation.age() > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| state.annotations.remove(id))
            .collect()
    }

    pub(crate) fn take_stale(&self) -> Vec<Annotation> {
        let mut state = self.state();
        let stale: Vec<ContentId> = state
            .annotations
            .iter()
            .filter(|(_, annotation)| !annotation.is_anchor_connected())
            .map(|(id, _)| id.clone())
            .collect();
        stale
            .iter()
            .filter_map(|id| state.annotations.remove(id))
            .collect()
    }
}

fn detach_all(operation: &'static str, annotations: &[Annotation]) -> RemovalSummary {
    let mut tally = RemovalTally::new(operation);
    for annotation in annotations {
        tally.record(annotation.detach());
    }
    tally.finish()
}
