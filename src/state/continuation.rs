//! Suspended-cycle continuations (`state/continuations/<token>.yaml`)

use crate::context::ProjectId;
use crate::engine::fsm::UnitState;
use crate::error::{EngineError, EngineResult};
use crate::store::layout::{atomic_write, validate_segment, ProjectPaths};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the proposal blocking a continuation ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposalOutcome {
    Applied { new_frozen_version: u32 },
    Rejected { rationale: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContinuationStatus {
    Suspended,
    Released { outcome: ProposalOutcome, released_at: String },
    Resumed { outcome: ProposalOutcome, resumed_at: String },
}

/// Handle that lets a suspended unit cycle resume exactly where it stopped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Continuation {
    pub token: String,
    pub project: String,
    pub cycle: String,
    pub chapter: u32,
    pub suspended_state: UnitState,
    /// Gate whose escalate decision suspended the cycle
    pub gate_id: String,
    pub proposal_id: Option<String>,
    pub created_at: String,
    pub status: ContinuationStatus,
}

impl Continuation {
    /// Token derived from the escalating gate, so a replayed escalation
    /// finds the same continuation
    pub fn token_for(gate_id: &str) -> String {
        format!("cont-{}", gate_id)
    }

    pub fn outcome(&self) -> Option<&ProposalOutcome> {
        match &self.status {
            ContinuationStatus::Suspended => None,
            ContinuationStatus::Released { outcome, .. } | ContinuationStatus::Resumed { outcome, .. } => Some(outcome),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContinuationStore {
    paths: ProjectPaths,
}

impl ContinuationStore {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    fn path(&self, token: &str) -> EngineResult<PathBuf> {
        validate_segment(token)?;
        Ok(self.paths.continuations_dir().join(format!("{}.yaml", token)))
    }

    pub fn save(&self, caller: &ProjectId, continuation: &Continuation) -> EngineResult<()> {
        self.paths.guard(caller)?;
        let content = serde_yaml::to_string(continuation)?;
        atomic_write(&self.path(&continuation.token)?, content.as_bytes())
    }

    pub fn load(&self, caller: &ProjectId, token: &str) -> EngineResult<Continuation> {
        self.find(caller, token)?
            .ok_or_else(|| EngineError::NotFound(format!("continuation {}", token)))
    }

    pub fn find(&self, caller: &ProjectId, token: &str) -> EngineResult<Option<Continuation>> {
        self.paths.guard(caller)?;
        let path = self.path(token)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(serde_yaml::from_str(&std::fs::read_to_string(path)?)?))
    }

    pub fn list(&self, caller: &ProjectId) -> EngineResult<Vec<Continuation>> {
        self.paths.guard(caller)?;
        let dir = self.paths.continuations_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                out.push(serde_yaml::from_str::<Continuation>(&std::fs::read_to_string(path)?)?);
            }
        }
        out.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(out)
    }

    /// Mark the continuation released with the proposal's outcome. Releasing
    /// twice keeps the first outcome.
    pub fn release(&self, caller: &ProjectId, token: &str, outcome: ProposalOutcome) -> EngineResult<Continuation> {
        let mut continuation = self.load(caller, token)?;
        if continuation.status == ContinuationStatus::Suspended {
            continuation.status = ContinuationStatus::Released {
                outcome,
                released_at: Utc::now().to_rfc3339(),
            };
            self.save(caller, &continuation)?;
            tracing::info!(token, "continuation released");
        }
        Ok(continuation)
    }

    pub fn mark_resumed(&self, caller: &ProjectId, token: &str) -> EngineResult<Continuation> {
        let mut continuation = self.load(caller, token)?;
        match continuation.status.clone() {
            ContinuationStatus::Released { outcome, .. } => {
                continuation.status = ContinuationStatus::Resumed {
                    outcome,
                    resumed_at: Utc::now().to_rfc3339(),
                };
                self.save(caller, &continuation)?;
            }
            ContinuationStatus::Resumed { .. } => {}
            ContinuationStatus::Suspended => {
                return Err(EngineError::IllegalTransition {
                    machine: "unit",
                    state: "Suspended".to_string(),
                    action: "Resume".to_string(),
                })
            }
        }
        Ok(continuation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::layout::Workspace;
    use tempfile::TempDir;

    fn sample() -> Continuation {
        Continuation {
            token: Continuation::token_for("unit-002-g01"),
            project: "alpha".to_string(),
            cycle: "unit-002".to_string(),
            chapter: 2,
            suspended_state: UnitState::Suspended,
            gate_id: "unit-002-g01".to_string(),
            proposal_id: Some("CP-20260101-0001".to_string()),
            created_at: Utc::now().to_rfc3339(),
            status: ContinuationStatus::Suspended,
        }
    }

    #[test]
    fn test_release_then_resume() {
        let temp = TempDir::new().unwrap();
        let id = ProjectId::new("alpha").unwrap();
        let paths = Workspace::new(temp.path()).project(&id);
        let store = ContinuationStore::new(paths);
        let cont = sample();
        store.save(&id, &cont).unwrap();

        assert!(store.mark_resumed(&id, &cont.token).is_err());

        let released = store
            .release(&id, &cont.token, ProposalOutcome::Applied { new_frozen_version: 2 })
            .unwrap();
        assert_eq!(released.outcome(), Some(&ProposalOutcome::Applied { new_frozen_version: 2 }));

        // a second release does not overwrite the outcome
        store
            .release(&id, &cont.token, ProposalOutcome::Rejected { rationale: "no".to_string() })
            .unwrap();
        let resumed = store.mark_resumed(&id, &cont.token).unwrap();
        assert!(matches!(resumed.status, ContinuationStatus::Resumed { .. }));
        assert_eq!(resumed.outcome(), Some(&ProposalOutcome::Applied { new_frozen_version: 2 }));
        assert_eq!(store.list(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_other_project_cannot_read() {
        let temp = TempDir::new().unwrap();
        let id = ProjectId::new("alpha").unwrap();
        let store = ContinuationStore::new(Workspace::new(temp.path()).project(&id));
        store.save(&id, &sample()).unwrap();
        let other = ProjectId::new("beta").unwrap();
        assert!(matches!(
            store.list(&other),
            Err(EngineError::IsolationViolation { .. })
        ));
    }
}
