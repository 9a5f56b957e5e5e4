//! Human decision vocabularies
//!
//! Each gate kind accepts a fixed set of actions. A [`RawDecision`] arrives
//! from outside (CLI, decision file, test script) and is parsed strictly:
//! unknown actions are invalid input, never mapped to a near match.

use crate::error::{EngineError, EngineResult};
use crate::models::AnchorId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Undecoded decision as submitted by a human
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawDecision {
    pub action: String,
    #[serde(default)]
    pub rationale: String,
    /// Anchors, unit ids or issue ids backing the decision
    #[serde(default)]
    pub references: Vec<String>,
    /// Rewrite instructions / revision instruction
    #[serde(default)]
    pub instructions: Vec<String>,
    /// Issue ids to waive
    #[serde(default)]
    pub issues: Vec<String>,
    /// Open question answers keyed by question id
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
}

impl RawDecision {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_references(mut self, refs: &[&str]) -> Self {
        self.references = refs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_instructions(mut self, lines: &[&str]) -> Self {
        self.instructions = lines.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_issues(mut self, ids: &[&str]) -> Self {
        self.issues = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_answer(mut self, id: &str, answer: &str) -> Self {
        self.answers.insert(id.to_string(), answer.to_string());
        self
    }

    fn normalized_action(&self) -> String {
        self.action.trim().to_ascii_lowercase()
    }
}

fn invalid(gate: &str, action: &str, expected: &[&str]) -> EngineError {
    EngineError::InvalidDecision {
        gate: gate.to_string(),
        action: action.to_string(),
        expected: expected.join(", "),
    }
}

// =============================================================================
// Unit gate
// =============================================================================

/// Issue waived by the human with a reason
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaivedIssue {
    pub issue_id: String,
    pub reason: String,
}

/// Decision at a unit human-review gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UnitDecision {
    Accept,
    RequestRewrite { instructions: Vec<String> },
    Waive { issues: Vec<WaivedIssue> },
    Escalate { reason: String, anchors: Vec<AnchorId> },
}

impl UnitDecision {
    pub const VOCABULARY: [&'static str; 4] = ["accept", "request_rewrite", "waive", "escalate"];

    pub fn action(&self) -> &'static str {
        match self {
            UnitDecision::Accept => "accept",
            UnitDecision::RequestRewrite { .. } => "request_rewrite",
            UnitDecision::Waive { .. } => "waive",
            UnitDecision::Escalate { .. } => "escalate",
        }
    }

    pub fn parse(gate: &str, raw: &RawDecision) -> EngineResult<Self> {
        match raw.normalized_action().as_str() {
            "accept" => Ok(UnitDecision::Accept),
            "request_rewrite" => {
                let instructions: Vec<String> = raw
                    .instructions
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if instructions.is_empty() {
                    return Err(EngineError::InvalidDecision {
                        gate: gate.to_string(),
                        action: raw.action.clone(),
                        expected: "request_rewrite with at least one instruction".to_string(),
                    });
                }
                Ok(UnitDecision::RequestRewrite { instructions })
            }
            "waive" => {
                if raw.issues.is_empty() || raw.rationale.trim().is_empty() {
                    return Err(EngineError::InvalidDecision {
                        gate: gate.to_string(),
                        action: raw.action.clone(),
                        expected: "waive with issue ids and a reason".to_string(),
                    });
                }
                let issues = raw
                    .issues
                    .iter()
                    .map(|id| WaivedIssue {
                        issue_id: id.trim().to_string(),
                        reason: raw.rationale.trim().to_string(),
                    })
                    .collect();
                Ok(UnitDecision::Waive { issues })
            }
            "escalate" => {
                let anchors = raw
                    .references
                    .iter()
                    .filter_map(|r| r.parse::<AnchorId>().ok())
                    .collect();
                Ok(UnitDecision::Escalate {
                    reason: raw.rationale.trim().to_string(),
                    anchors,
                })
            }
            _ => Err(invalid(gate, &raw.action, &Self::VOCABULARY)),
        }
    }
}

// =============================================================================
// Materials gate
// =============================================================================

/// Decision at the materials human-review gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MaterialsDecision {
    Freeze,
    Revise { instruction: String },
    AnswerQuestions { answers: BTreeMap<String, String> },
}

impl MaterialsDecision {
    pub const VOCABULARY: [&'static str; 3] = ["freeze", "revise", "answer_questions"];

    pub fn parse(gate: &str, raw: &RawDecision) -> EngineResult<Self> {
        match raw.normalized_action().as_str() {
            "freeze" => Ok(MaterialsDecision::Freeze),
            "revise" => {
                let instruction = raw.instructions.join("\n").trim().to_string();
                if instruction.is_empty() {
                    return Err(EngineError::InvalidDecision {
                        gate: gate.to_string(),
                        action: raw.action.clone(),
                        expected: "revise with a revision instruction".to_string(),
                    });
                }
                Ok(MaterialsDecision::Revise { instruction })
            }
            "answer_questions" => {
                if raw.answers.is_empty() {
                    return Err(EngineError::InvalidDecision {
                        gate: gate.to_string(),
                        action: raw.action.clone(),
                        expected: "answer_questions with at least one answer".to_string(),
                    });
                }
                Ok(MaterialsDecision::AnswerQuestions {
                    answers: raw.answers.clone(),
                })
            }
            _ => Err(invalid(gate, &raw.action, &Self::VOCABULARY)),
        }
    }
}

// =============================================================================
// Proposal gate
// =============================================================================

/// Decision at the change-proposal approval gate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalDecision {
    Approve,
    Reject,
}

impl ProposalDecision {
    pub const VOCABULARY: [&'static str; 2] = ["approve", "reject"];

    pub fn parse(gate: &str, raw: &RawDecision) -> EngineResult<Self> {
        match raw.normalized_action().as_str() {
            "approve" => Ok(ProposalDecision::Approve),
            "reject" => {
                if raw.rationale.trim().is_empty() {
                    return Err(EngineError::InvalidDecision {
                        gate: gate.to_string(),
                        action: raw.action.clone(),
                        expected: "reject with a rationale".to_string(),
                    });
                }
                Ok(ProposalDecision::Reject)
            }
            _ => Err(invalid(gate, &raw.action, &Self::VOCABULARY)),
        }
    }
}
