use crate::engine::fsm::ProposalState;
use crate::error::{EngineError, EngineResult};
use crate::models::materials::PACK_LAYERS;
use crate::models::unit::{parse_unit_id, unit_id};
use crate::models::{AnchorId, ProposalDecision};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Proposal id: `CP-YYYYMMDD-NNNN`
pub fn proposal_id(day: &str, seq: u32) -> String {
    format!("CP-{}-{:04}", day, seq)
}

/// Validate a proposal id before it is used as a directory name
pub fn validate_proposal_id(id: &str) -> EngineResult<()> {
    let parts: Vec<&str> = id.split('-').collect();
    let ok = parts.len() == 3
        && parts[0] == "CP"
        && parts[1].len() == 8
        && parts[1].chars().all(|c| c.is_ascii_digit())
        && parts[2].len() == 4
        && parts[2].chars().all(|c| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(EngineError::InvalidId(format!("proposal id '{}' must look like CP-YYYYMMDD-NNNN", id)))
    }
}

// =============================================================================
// Evidence
// =============================================================================

/// Evidence that triggered a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Evidence {
    /// Anchor inside the frozen materials
    Anchor(AnchorId),
    /// A produced unit (`unit-003`)
    Unit(u32),
    /// A review issue of a unit (`unit-003#ISS-3`)
    Issue { chapter: u32, issue_id: String },
}

impl Evidence {
    pub fn parse(s: &str) -> EngineResult<Self> {
        let s = s.trim();
        if let Some((unit, issue)) = s.split_once('#') {
            let chapter = parse_unit_id(unit)
                .ok_or_else(|| EngineError::InvalidId(format!("evidence '{}' has an invalid unit id", s)))?;
            if issue.trim().is_empty() {
                return Err(EngineError::InvalidId(format!("evidence '{}' has an empty issue id", s)));
            }
            return Ok(Evidence::Issue {
                chapter,
                issue_id: issue.trim().to_string(),
            });
        }
        if let Some(chapter) = parse_unit_id(s) {
            return Ok(Evidence::Unit(chapter));
        }
        s.parse::<AnchorId>().map(Evidence::Anchor).map_err(|_| {
            EngineError::InvalidId(format!(
                "evidence '{}' must be an anchor (KIND-NNN), a unit (unit-NNN) or an issue (unit-NNN#ID)",
                s
            ))
        })
    }
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evidence::Anchor(id) => write!(f, "{}", id),
            Evidence::Unit(chapter) => f.write_str(&unit_id(*chapter)),
            Evidence::Issue { chapter, issue_id } => write!(f, "{}#{}", unit_id(*chapter), issue_id),
        }
    }
}

impl TryFrom<String> for Evidence {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Evidence::parse(&value)
    }
}

impl From<Evidence> for String {
    fn from(e: Evidence) -> Self {
        e.to_string()
    }
}

// =============================================================================
// Migration plan
// =============================================================================

/// One mutation applied to the refreeze draft
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MigrationOp {
    /// Replace (or create) the value at `path`
    Set { path: String, value: Value },
    /// Push onto the array at `path`
    Append { path: String, value: Value },
    /// Delete the entry at `path`
    Remove { path: String },
}

impl MigrationOp {
    pub fn path(&self) -> &str {
        match self {
            MigrationOp::Set { path, .. } | MigrationOp::Append { path, .. } | MigrationOp::Remove { path } => path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub op: MigrationOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse `canon.world.rules[2].name` into segments
fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let mut out = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if key.is_empty() {
            return None;
        }
        out.push(Segment::Key(key.to_string()));
        while !rest.is_empty() {
            let close = rest.find(']')?;
            let idx = rest.get(1..close)?.parse().ok()?;
            out.push(Segment::Index(idx));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return None;
            }
        }
    }
    Some(out)
}

fn descend<'a>(mut cur: &'a mut Value, segments: &[Segment], create: bool) -> Option<&'a mut Value> {
    for seg in segments {
        cur = match seg {
            Segment::Key(k) => {
                let obj = cur.as_object_mut()?;
                if create && !obj.contains_key(k) {
                    obj.insert(k.clone(), Value::Object(Default::default()));
                }
                obj.get_mut(k)?
            }
            Segment::Index(i) => cur.as_array_mut()?.get_mut(*i)?,
        };
    }
    Some(cur)
}

impl MigrationStep {
    /// Apply the step to a pack. Steps may only touch the four content layers.
    pub fn apply(&self, pack: &mut Value) -> Result<(), String> {
        let path = self.op.path();
        let segments = parse_path(path).ok_or_else(|| format!("invalid path '{}'", path))?;
        match segments.first() {
            Some(Segment::Key(layer)) if PACK_LAYERS.contains(&layer.as_str()) => {}
            _ => return Err(format!("path '{}' must start with one of {:?}", path, PACK_LAYERS)),
        }
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| format!("invalid path '{}'", path))?;

        match &self.op {
            MigrationOp::Set { value, .. } => {
                let parent = descend(pack, parents, true).ok_or_else(|| format!("cannot reach '{}'", path))?;
                match last {
                    Segment::Key(k) => {
                        parent
                            .as_object_mut()
                            .ok_or_else(|| format!("parent of '{}' is not an object", path))?
                            .insert(k.clone(), value.clone());
                    }
                    Segment::Index(i) => {
                        let slot = parent
                            .as_array_mut()
                            .and_then(|a| a.get_mut(*i))
                            .ok_or_else(|| format!("index out of range at '{}'", path))?;
                        *slot = value.clone();
                    }
                }
            }
            MigrationOp::Append { value, .. } => {
                let target = descend(pack, &segments, false).ok_or_else(|| format!("cannot reach '{}'", path))?;
                target
                    .as_array_mut()
                    .ok_or_else(|| format!("'{}' is not an array", path))?
                    .push(value.clone());
            }
            MigrationOp::Remove { .. } => {
                let parent = descend(pack, parents, false).ok_or_else(|| format!("cannot reach '{}'", path))?;
                let removed = match last {
                    Segment::Key(k) => parent.as_object_mut().and_then(|o| o.remove(k)).is_some(),
                    Segment::Index(i) => match parent.as_array_mut() {
                        Some(a) if *i < a.len() => {
                            a.remove(*i);
                            true
                        }
                        _ => false,
                    },
                };
                if !removed {
                    return Err(format!("nothing to remove at '{}'", path));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Proposal record
// =============================================================================

/// Input to `ChangeProposalManager::submit`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalInput {
    pub what: String,
    pub why: String,
    pub impact: String,
    pub migration_plan: Vec<MigrationStep>,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalDecisionRecord {
    pub decision: ProposalDecision,
    pub rationale: String,
    pub gate_id: String,
    pub decided_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationOutcome {
    pub base_version: u32,
    pub draft_version: u32,
    pub new_frozen_version: Option<u32>,
    pub applied_steps: Vec<String>,
}

/// Persisted proposal (`changes/<id>/proposal.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: String,
    pub project: String,
    pub created_at: String,
    pub created_in_run: String,
    /// Frozen version the proposal targets
    pub target_version: u32,
    pub what: String,
    pub why: String,
    pub impact: String,
    pub migration_plan: Vec<MigrationStep>,
    pub alternatives: Vec<String>,
    pub evidence: Vec<Evidence>,
    /// Continuation of the suspended unit cycle, when escalated
    #[serde(default)]
    pub continuation: Option<String>,
    pub state: ProposalState,
    #[serde(default)]
    pub advisor_notes: Option<String>,
    #[serde(default)]
    pub decision: Option<ProposalDecisionRecord>,
    #[serde(default)]
    pub migration: Option<MigrationOutcome>,
    /// Diagnosis when halted on a replay mismatch
    #[serde(default)]
    pub halted: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_evidence_parse() {
        assert_eq!(Evidence::parse("unit-003").unwrap(), Evidence::Unit(3));
        assert!(matches!(Evidence::parse("WR-002").unwrap(), Evidence::Anchor(_)));
        assert_eq!(
            Evidence::parse("unit-003#ISS-3").unwrap(),
            Evidence::Issue {
                chapter: 3,
                issue_id: "ISS-3".to_string()
            }
        );
        assert!(Evidence::parse("because I said so").is_err());
        assert_eq!(Evidence::parse("unit-003#ISS-3").unwrap().to_string(), "unit-003#ISS-3");
    }

    #[test]
    fn test_proposal_id_validation() {
        assert!(validate_proposal_id(&proposal_id("20260101", 7)).is_ok());
        assert!(validate_proposal_id("CP-2026-0001").is_err());
        assert!(validate_proposal_id("../CP-20260101-0001").is_err());
    }

    #[test]
    fn test_migration_ops() {
        let mut pack = json!({
            "canon": {"world": {"rules": [{"name": "no magic"}]}},
            "meta": {}
        });
        let set = MigrationStep {
            id: "s1".to_string(),
            description: String::new(),
            op: MigrationOp::Set {
                path: "canon.world.rules[0].name".to_string(),
                value: json!("rare magic"),
            },
        };
        set.apply(&mut pack).unwrap();
        assert_eq!(pack["canon"]["world"]["rules"][0]["name"], "rare magic");

        let append = MigrationStep {
            id: "s2".to_string(),
            description: String::new(),
            op: MigrationOp::Append {
                path: "canon.world.rules".to_string(),
                value: json!({"name": "iron burns fae"}),
            },
        };
        append.apply(&mut pack).unwrap();
        assert_eq!(pack["canon"]["world"]["rules"].as_array().unwrap().len(), 2);

        let create = MigrationStep {
            id: "s3".to_string(),
            description: String::new(),
            op: MigrationOp::Set {
                path: "canon.style.voice".to_string(),
                value: json!("wry"),
            },
        };
        create.apply(&mut pack).unwrap();
        assert_eq!(pack["canon"]["style"]["voice"], "wry");

        let remove = MigrationStep {
            id: "s4".to_string(),
            description: String::new(),
            op: MigrationOp::Remove {
                path: "canon.world.rules[0]".to_string(),
            },
        };
        remove.apply(&mut pack).unwrap();
        assert_eq!(pack["canon"]["world"]["rules"][0]["name"], "iron burns fae");
    }

    #[test]
    fn test_migration_cannot_touch_meta_or_changelog() {
        let mut pack = json!({"meta": {"version": 1}, "changelog": []});
        for path in ["meta.version", "changelog"] {
            let step = MigrationStep {
                id: "x".to_string(),
                description: String::new(),
                op: MigrationOp::Set {
                    path: path.to_string(),
                    value: json!(9),
                },
            };
            assert!(step.apply(&mut pack).is_err());
        }
    }
}
