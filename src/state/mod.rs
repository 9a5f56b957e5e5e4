//! Run-scoped persistent state
//!
//! - Continuations of suspended unit cycles
//! - The single-writer project lock and run metadata

pub mod continuation;
pub mod lock;

pub use continuation::{Continuation, ContinuationStatus, ContinuationStore, ProposalOutcome};
pub use lock::{LockInfo, ProjectLock, RunMeta, RunStatus};
