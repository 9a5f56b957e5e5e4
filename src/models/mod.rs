pub mod anchor;
pub mod config;
pub mod decision;
pub mod materials;
pub mod proposal;
pub mod unit;

pub use anchor::{AnchorId, AnchorKind};
pub use config::{AuditConfig, CapabilityConfig, EngineConfig, RunConfig, WorkflowConfig, CONFIG_FILE};
pub use decision::{MaterialsDecision, ProposalDecision, RawDecision, UnitDecision, WaivedIssue};
pub use materials::{ChangelogEntry, Conflict, OpenQuestion};
pub use proposal::{Evidence, MigrationOp, MigrationStep, ProposalInput, ProposalRecord};
pub use unit::{HumanReviewRecord, MemoryRecord, ReviewIssue, ReviewReport, ReviewVerdict};
