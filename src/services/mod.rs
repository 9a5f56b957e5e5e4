//! Service layer for inkgate
//!
//! Filesystem services around a run that sit outside the state machines:
//! the disposable session area and consented stage archives.

pub mod archive;
pub mod session;

pub use archive::{archive_run, ArchiveOutcome};
pub use session::{snapshot_materials, snapshot_version};
