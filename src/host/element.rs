use std::fmt;
use std::sync::{Arc, Weak};

/// Stable identity of a host element, independent of how many handles point at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors surfaced by the host environment. All of them are expected during
/// teardown and are handled locally by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    Detached { element: ElementId },
    Disconnected,
    Rejected {
        operation: &'static str,
        reason: String,
    },
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Detached { element } => {
                write!(f, "element {element} is no longer attached to the document")
            }
            HostError::Disconnected => write!(f, "host observation is already disconnected"),
            HostError::Rejected { operation, reason } => {
                write!(f, "host rejected {operation}: {reason}")
            }
        }
    }
}

impl std::error::Error for HostError {}

/// A node living in the host document.
///
/// Implementations must be cheap to query; the engine calls `is_connected` on
/// every staleness check.
pub trait HostElement: Send + Sync + fmt::Debug {
    fn id(&self) -> ElementId;

    /// Whether the element is currently attached to the live document.
    fn is_connected(&self) -> bool;

    /// Detaches the element from its parent. Removing an already detached
    /// element is a no-op.
    fn remove(&self) -> Result<(), HostError>;

    fn attribute(&self, name: &str) -> Option<String>;

    fn set_attribute(&self, name: &str, value: &str) -> Result<(), HostError>;

    fn remove_attribute(&self, name: &str) -> Result<(), HostError>;

    fn has_class(&self, class: &str) -> bool;

    /// True when the element or any of its descendants carries `class`.
    fn contains_class(&self, class: &str) -> bool;
}

pub type ElementRef = Arc<dyn HostElement>;
pub type WeakElementRef = Weak<dyn HostElement>;
