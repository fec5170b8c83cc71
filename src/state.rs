//! Generation-tagged annotation state: the registry, annotation records, and
//! ancillary per-identity metadata.

pub mod annotation;
pub mod registry;

pub use annotation::{AnchorPlacement, Annotation, AnnotationSnapshot, ContentId, ResolvedTarget};
pub use registry::StateRegistry;
