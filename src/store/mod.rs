//! Versioned artifact storage
//!
//! - [`layout`]: project namespaces, isolation guard and atomic file writes
//! - [`artifact`]: write-once slots and version pointers per artifact family
//! - [`anchors`]: stable anchor allocation and resolution
//! - [`freeze`]: freezing a draft into an immutable, anchored pack

pub mod anchors;
pub mod artifact;
pub mod freeze;
pub mod layout;

pub use anchors::{AnchorBinding, AnchorIndex};
pub use artifact::{ArtifactRef, ArtifactStore, Family, PointerRef, WriteOutcome};
pub use freeze::{freeze_materials, FreezeKind, FreezeOutcome};
pub use layout::{checksum, ProjectPaths, Workspace};
