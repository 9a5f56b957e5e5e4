//! Engine error taxonomy
//!
//! Every fallible core operation returns [`EngineResult`]. Variants map onto
//! the categories a human operator needs to tell apart: gate blocks are
//! cleared by a decision, fatal categories halt the cycle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for all core operations
pub type EngineResult<T> = Result<T, EngineError>;

/// A single failing gate predicate with the items that caused it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedPredicate {
    /// Predicate name, e.g. `blocker_open_questions == 0`
    pub predicate: String,
    /// Offending ids or paths
    pub details: Vec<String>,
}

impl fmt::Display for FailedPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.predicate)
        } else {
            write!(f, "{} [{}]", self.predicate, self.details.join(", "))
        }
    }
}

fn join_predicates(predicates: &[FailedPredicate]) -> String {
    predicates
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by the workflow engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Gate '{gate}' is blocked: {}", join_predicates(.predicates))]
    BlockedGate {
        gate: String,
        predicates: Vec<FailedPredicate>,
    },

    #[error("Illegal transition in {machine} machine: action '{action}' is not defined from state '{state}'")]
    IllegalTransition {
        machine: &'static str,
        state: String,
        action: String,
    },

    #[error("Isolation violation: project '{caller}' attempted to access '{target}'")]
    IsolationViolation { caller: String, target: String },

    #[error("Canon is writable only through freeze or an approved migration: {0}")]
    CanonWriteDenied(String),

    #[error("Capability '{role}' failed after {attempts} attempt(s): {message}")]
    CapabilityFailure {
        role: String,
        attempts: u32,
        message: String,
    },

    #[error("Version conflict: {family} v{version:03} already exists with different content")]
    VersionConflict { family: String, version: u32 },

    #[error("Migration replay mismatch for {proposal_id} at step '{step}': {detail}")]
    MigrationReplayMismatch {
        proposal_id: String,
        step: String,
        detail: String,
    },

    #[error("Invalid decision '{action}' for gate {gate}: expected one of {expected}")]
    InvalidDecision {
        gate: String,
        action: String,
        expected: String,
    },

    #[error("Proposal rejected at submission: {0}")]
    InvalidProposal(String),

    #[error("Anchor {anchor} not found at version v{version:03}")]
    AnchorNotFound { anchor: String, version: u32 },

    #[error("Rewrite budget exhausted for chapter {chapter}: limit is {limit} rewrite round(s)")]
    RewriteBudgetExhausted { chapter: u32, limit: u32 },

    #[error("Proposal budget exhausted for this run (limit {limit})")]
    ProposalBudgetExhausted { limit: u32 },

    #[error("Project '{project}' is held by live run {run_id}")]
    ProjectBusy { project: String, run_id: String },

    #[error("Audit log corrupted: {0}")]
    LogCorruption(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Project has no frozen materials yet")]
    NotFrozen,

    #[error("Materials are already frozen at v{0:03}; changes require a change proposal")]
    AlreadyFrozen(u32),

    #[error("Operation '{0}' requires explicit consent")]
    ConsentRequired(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

/// Coarse classification used in halt reports and audit events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    BlockedGate,
    IllegalTransition,
    IsolationViolation,
    CapabilityFailure,
    VersionConflict,
    MigrationReplayMismatch,
    InvalidInput,
    Budget,
    Concurrency,
    Corruption,
    Storage,
}

impl ErrorCategory {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCategory::BlockedGate => "blocked_gate",
            ErrorCategory::IllegalTransition => "illegal_transition",
            ErrorCategory::IsolationViolation => "isolation_violation",
            ErrorCategory::CapabilityFailure => "capability_failure",
            ErrorCategory::VersionConflict => "version_conflict",
            ErrorCategory::MigrationReplayMismatch => "migration_replay_mismatch",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Budget => "budget",
            ErrorCategory::Concurrency => "concurrency",
            ErrorCategory::Corruption => "corruption",
            ErrorCategory::Storage => "storage",
        }
    }
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::BlockedGate { .. } => ErrorCategory::BlockedGate,
            EngineError::IllegalTransition { .. } => ErrorCategory::IllegalTransition,
            EngineError::IsolationViolation { .. } | EngineError::CanonWriteDenied(_) => {
                ErrorCategory::IsolationViolation
            }
            EngineError::CapabilityFailure { .. } => ErrorCategory::CapabilityFailure,
            EngineError::VersionConflict { .. } => ErrorCategory::VersionConflict,
            EngineError::MigrationReplayMismatch { .. } => ErrorCategory::MigrationReplayMismatch,
            EngineError::InvalidDecision { .. }
            | EngineError::InvalidProposal(_)
            | EngineError::AnchorNotFound { .. }
            | EngineError::NotFound(_)
            | EngineError::InvalidId(_)
            | EngineError::UnknownEventType(_)
            | EngineError::NotFrozen
            | EngineError::AlreadyFrozen(_)
            | EngineError::ConsentRequired(_) => ErrorCategory::InvalidInput,
            EngineError::RewriteBudgetExhausted { .. }
            | EngineError::ProposalBudgetExhausted { .. } => ErrorCategory::Budget,
            EngineError::ProjectBusy { .. } => ErrorCategory::Concurrency,
            EngineError::LogCorruption(_) => ErrorCategory::Corruption,
            EngineError::Io(_)
            | EngineError::Json(_)
            | EngineError::Yaml(_)
            | EngineError::Toml(_) => ErrorCategory::Storage,
        }
    }

    /// Whether a later human action or resumed run can clear the condition
    /// without repairing state by hand.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::BlockedGate
                | ErrorCategory::CapabilityFailure
                | ErrorCategory::InvalidInput
                | ErrorCategory::Concurrency
        )
    }

    pub(crate) fn illegal(machine: &'static str, state: impl fmt::Debug, action: impl fmt::Debug) -> Self {
        EngineError::IllegalTransition {
            machine,
            state: format!("{:?}", state),
            action: format!("{:?}", action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_gate_message_lists_predicates() {
        let err = EngineError::BlockedGate {
            gate: "materials-freeze".to_string(),
            predicates: vec![FailedPredicate {
                predicate: "blocker_open_questions == 0".to_string(),
                details: vec!["OQ-001".to_string()],
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("blocker_open_questions == 0"));
        assert!(msg.contains("OQ-001"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_fatal_categories_are_not_recoverable() {
        let err = EngineError::IsolationViolation {
            caller: "a".to_string(),
            target: "b".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::IsolationViolation);
        assert!(!err.is_recoverable());

        let err = EngineError::VersionConflict {
            family: "materials".to_string(),
            version: 7,
        };
        assert!(err.to_string().contains("v007"));
        assert!(!err.is_recoverable());
    }
}
