//! Post-freeze change proposals
//!
//! - Submission, advisor review and the approval gate
//! - Idempotent migration into a new draft and refreeze

pub mod manager;
pub mod migration;

pub use manager::{approval_gate_id, AdvisorReview, ChangeProposalManager};
pub use migration::{apply_plan, MigrationLog, StepResult};
