use crate::host::{ElementId, ElementRef, HostError, WeakElementRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Identity of one piece of host-page content (a title, a product, a post).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Target a content identity resolves to (for example an external catalogue id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ResolvedTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Where an annotation is placed relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPlacement {
    #[default]
    TopRight,
    TopLeft,
    BottomRight,
    BottomLeft,
}

/// A rendered overlay attached to one content anchor.
///
/// The annotation owns its rendered element and only observes the anchor: the
/// anchor may be removed by the host at any time, which makes the annotation
/// stale without keeping the anchor alive.
pub struct Annotation {
    id: ContentId,
    generation: u64,
    element: ElementRef,
    anchor: WeakElementRef,
    created_at: Instant,
}

impl Annotation {
    pub fn new(id: ContentId, generation: u64, element: ElementRef, anchor: &ElementRef) -> Self {
        Self {
            id,
            generation,
            element,
            anchor: Arc::downgrade(anchor),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &ContentId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn element_id(&self) -> ElementId {
        self.element.id()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// The anchor, if it is still alive.
    pub fn anchor(&self) -> Option<ElementRef> {
        self.anchor.upgrade()
    }

    pub fn is_anchor_connected(&self) -> bool {
        self.anchor
            .upgrade()
            .map(|anchor| anchor.is_connected())
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> AnnotationSnapshot {
        AnnotationSnapshot {
            id: self.id.clone(),
            generation: self.generation,
            element: self.element.id(),
            anchor_connected: self.is_anchor_connected(),
            created_at: self.created_at,
        }
    }

    /// Detaches the rendered element from the document.
    pub(crate) fn detach(&self) -> Result<(), HostError> {
        if !self.element.is_connected() {
            return Ok(());
        }
        self.element.remove()
    }

    pub(crate) fn into_element(self) -> ElementRef {
        self.element
    }
}

impl fmt::Debug for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Annotation")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("element", &self.element.id())
            .field("anchor_connected", &self.is_anchor_connected())
            .finish()
    }
}

/// Read-only view of an [`Annotation`] handed out by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationSnapshot {
    pub id: ContentId,
    pub generation: u64,
    pub element: ElementId,
    pub anchor_connected: bool,
    pub created_at: Instant,
}
