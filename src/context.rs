//! Per-run context
//!
//! A [`RunContext`] is built once at run start and threaded through every
//! engine call. Nothing in the core reads ambient global state.

use crate::error::{EngineError, EngineResult};
use crate::models::EngineConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

fn project_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("valid project id regex"))
}

/// Project identifier: the isolation boundary for every store access
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    /// Validate and wrap a project id (lowercase alphanumeric, `-`, `_`)
    pub fn new(id: impl Into<String>) -> EngineResult<Self> {
        let id = id.into();
        if !project_id_regex().is_match(&id) {
            return Err(EngineError::InvalidId(format!(
                "project id '{}' must be lowercase alphanumeric with '-' or '_'",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProjectId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ProjectId::new(value)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run identifier: `run-NNNN-xxxxxxxx`, ordered by its sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub seq: u32,
    pub id: String,
}

impl RunId {
    pub fn new(seq: u32) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            seq,
            id: format!("run-{:04}-{}", seq, &suffix[..8]),
        }
    }

    /// Parse a directory name produced by [`RunId::new`]
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("run-")?;
        let (seq, suffix) = rest.split_once('-')?;
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            seq: seq.parse().ok()?,
            id: name.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Explicit state for one run; its lifetime is exactly one run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub project: ProjectId,
    pub run_id: RunId,
    /// Frozen materials version in effect, `None` before the first freeze
    pub frozen_version: Option<u32>,
    /// Change proposals opened by this run
    pub proposals_opened: u32,
    pub config: EngineConfig,
}

impl RunContext {
    pub fn new(project: ProjectId, run_id: RunId, config: EngineConfig) -> Self {
        Self {
            project,
            run_id,
            frozen_version: None,
            proposals_opened: 0,
            config,
        }
    }

    /// Frozen version or [`EngineError::NotFrozen`]
    pub fn require_frozen(&self) -> EngineResult<u32> {
        self.frozen_version.ok_or(EngineError::NotFrozen)
    }

    /// Fail when the run may not open another proposal
    pub fn check_proposal_budget(&self) -> EngineResult<()> {
        let limit = self.config.workflow.proposal_budget;
        if self.proposals_opened >= limit {
            return Err(EngineError::ProposalBudgetExhausted { limit });
        }
        Ok(())
    }

    /// Count one proposal against the run budget
    pub fn charge_proposal(&mut self) -> EngineResult<()> {
        self.check_proposal_budget()?;
        self.proposals_opened += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_validation() {
        assert!(ProjectId::new("my-novel_2").is_ok());
        assert!(ProjectId::new("").is_err());
        assert!(ProjectId::new("../other").is_err());
        assert!(ProjectId::new("Upper").is_err());
        assert!(ProjectId::new("a/b").is_err());
    }

    #[test]
    fn test_run_id_round_trip() {
        let run = RunId::new(12);
        assert!(run.as_str().starts_with("run-0012-"));
        let parsed = RunId::parse(run.as_str()).unwrap();
        assert_eq!(parsed, run);
        assert!(RunId::parse("session").is_none());
        assert!(RunId::parse("run-x-abc").is_none());
    }

    #[test]
    fn test_proposal_budget() {
        let mut config = EngineConfig::default();
        config.workflow.proposal_budget = 1;
        let mut ctx = RunContext::new(ProjectId::new("p").unwrap(), RunId::new(1), config);
        assert!(ctx.charge_proposal().is_ok());
        assert!(matches!(
            ctx.charge_proposal(),
            Err(EngineError::ProposalBudgetExhausted { limit: 1 })
        ));
    }
}
