//! Artifact persistence.
//!
//! Artifacts are immutable, versioned documents keyed by run id and name,
//! each tagged with the content categories its producer declared.

mod store;
mod types;

pub use store::ArtifactStore;
pub use types::{
    Artifact, ArtifactContent, ArtifactDraft, ArtifactKind, ArtifactRef, Category, RunId,
};
