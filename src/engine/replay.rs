//! Rebuilding cycle state from the audit log
//!
//! Every committed transition ends with a `node_end` event carrying the
//! cycle snapshot after the transition plus the artifacts and pointers it
//! committed. Replaying those events in (run, seq) order yields the state of
//! every cycle, the set of committed slots, and the last committed version
//! of every pointer. Anything on disk that is not in that set was written by
//! a transition that never finished.

use super::fsm::Machine;
use crate::audit::{Event, EventType};
use crate::context::RunId;
use crate::error::{EngineError, EngineResult};
use crate::store::{ArtifactRef, PointerRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// State of one cycle after a committed transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleSnapshot {
    pub machine: String,
    /// `materials`, `unit-003`, or a proposal id
    pub cycle: String,
    pub chapter: u32,
    /// Machine state in its snake_case form
    pub state: Value,
    /// Review round (materials) or text round (unit)
    #[serde(default)]
    pub round: u32,
    /// Draft version (materials) or frozen version in use (unit)
    #[serde(default)]
    pub version: u32,
    /// Gates opened so far in this cycle
    #[serde(default)]
    pub gates: u32,
    #[serde(default)]
    pub gate_id: Option<String>,
    #[serde(default)]
    pub continuation: Option<String>,
}

impl CycleSnapshot {
    pub fn initial<M: Machine>(cycle: &str, chapter: u32) -> EngineResult<Self> {
        Ok(Self {
            machine: M::NAME.to_string(),
            cycle: cycle.to_string(),
            chapter,
            state: serde_json::to_value(M::initial())?,
            round: 0,
            version: 0,
            gates: 0,
            gate_id: None,
            continuation: None,
        })
    }

    pub fn state<M: Machine>(&self) -> EngineResult<M::State> {
        if self.machine != M::NAME {
            return Err(EngineError::LogCorruption(format!(
                "cycle {} belongs to the {} machine, not {}",
                self.cycle,
                self.machine,
                M::NAME
            )));
        }
        Ok(serde_json::from_value(self.state.clone())?)
    }

    pub fn set_state<M: Machine>(&mut self, state: M::State) -> EngineResult<()> {
        self.state = serde_json::to_value(state)?;
        Ok(())
    }
}

/// Everything the engine derives from replaying the log
#[derive(Debug, Clone, Default)]
pub struct CycleTable {
    cycles: BTreeMap<String, CycleSnapshot>,
    /// Project-relative paths of committed slots
    committed: BTreeSet<String>,
    /// Family key -> last committed pointer version
    pointers: BTreeMap<String, u32>,
    /// Proposal id -> step id -> result hash
    migration_steps: BTreeMap<String, BTreeMap<String, String>>,
    /// Proposals whose submission was logged
    submitted: BTreeSet<String>,
    last_run: Option<String>,
}

impl CycleTable {
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a (RunId, Event)>) -> EngineResult<Self> {
        let mut table = Self::default();
        for (run, event) in events {
            table.observe(event)?;
            table.last_run = Some(run.to_string());
        }
        Ok(table)
    }

    /// Fold one event into the table
    pub fn observe(&mut self, event: &Event) -> EngineResult<()> {
        match event.event_type {
            EventType::NodeEnd => {
                let corrupt = |what: &str, e: serde_json::Error| {
                    EngineError::LogCorruption(format!("node_end seq {} has bad {}: {}", event.seq, what, e))
                };
                let Some(snapshot) = event.fields.get("snapshot") else {
                    return Ok(());
                };
                let snapshot: CycleSnapshot =
                    serde_json::from_value(snapshot.clone()).map_err(|e| corrupt("snapshot", e))?;
                if let Some(artifacts) = event.fields.get("artifacts") {
                    let artifacts: Vec<ArtifactRef> =
                        serde_json::from_value(artifacts.clone()).map_err(|e| corrupt("artifacts", e))?;
                    self.committed.extend(artifacts.into_iter().map(|a| a.path));
                }
                if let Some(pointers) = event.fields.get("pointers") {
                    let pointers: Vec<PointerRef> =
                        serde_json::from_value(pointers.clone()).map_err(|e| corrupt("pointers", e))?;
                    for p in pointers {
                        self.pointers.insert(p.family, p.version);
                    }
                }
                self.cycles.insert(snapshot.cycle.clone(), snapshot);
            }
            EventType::MigrationStep => {
                if let (Some(proposal), Some(step), Some(hash)) = (
                    event.str_field("proposal_id"),
                    event.str_field("step_id"),
                    event.str_field("result_hash"),
                ) {
                    self.migration_steps
                        .entry(proposal.to_string())
                        .or_default()
                        .insert(step.to_string(), hash.to_string());
                }
            }
            EventType::ProposalSubmitted => {
                if let Some(id) = event.str_field("proposal_id") {
                    self.submitted.insert(id.to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn cycle(&self, id: &str) -> Option<&CycleSnapshot> {
        self.cycles.get(id)
    }

    pub fn cycles(&self) -> impl Iterator<Item = &CycleSnapshot> {
        self.cycles.values()
    }

    pub fn is_committed(&self, rel_path: &str) -> bool {
        self.committed.contains(rel_path)
    }

    pub fn committed_pointer(&self, family_key: &str) -> Option<u32> {
        self.pointers.get(family_key).copied()
    }

    pub fn pointer_families(&self) -> impl Iterator<Item = &String> {
        self.pointers.keys()
    }

    pub fn migration_steps(&self, proposal_id: &str) -> BTreeMap<String, String> {
        self.migration_steps.get(proposal_id).cloned().unwrap_or_default()
    }

    pub fn is_submitted(&self, proposal_id: &str) -> bool {
        self.submitted.contains(proposal_id)
    }

    pub fn last_run(&self) -> Option<&str> {
        self.last_run.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fsm::{UnitMachine, UnitState};
    use serde_json::json;
    use std::collections::BTreeMap as Map;

    fn event(seq: u64, event_type: EventType, fields: Value) -> Event {
        Event {
            event_id: format!("e{}", seq),
            run_id: "run-0001-aaaaaaaa".to_string(),
            project: "alpha".to_string(),
            seq,
            ts: String::new(),
            stage: "stage1".to_string(),
            phase: "unit".to_string(),
            chapter: 1,
            node: String::new(),
            event_type,
            fields: fields.as_object().cloned().unwrap(),
            payloads: Map::new(),
        }
    }

    fn snapshot(state: UnitState, round: u32) -> Value {
        let mut snap = CycleSnapshot::initial::<UnitMachine>("unit-001", 1).unwrap();
        snap.set_state::<UnitMachine>(state).unwrap();
        snap.round = round;
        serde_json::to_value(snap).unwrap()
    }

    #[test]
    fn test_last_node_end_wins() {
        let run = RunId::parse("run-0001-aaaaaaaa").unwrap();
        let events = vec![
            (run.clone(), event(1, EventType::NodeEnd, json!({
                "snapshot": snapshot(UnitState::AgentReview, 1),
                "artifacts": [{"family": "unit_text/unit-001", "version": 1, "path": "units/unit-001/draft.v001.md", "hash": "sha256:a"}],
                "pointers": [{"family": "unit_text/unit-001", "version": 1}]
            }))),
            // a started but unfinished transition leaves no trace in the table
            (run.clone(), event(2, EventType::NodeStart, json!({"cycle": "unit-001"}))),
            (run.clone(), event(3, EventType::NodeEnd, json!({
                "snapshot": snapshot(UnitState::HumanReviewGate, 1),
                "artifacts": [],
                "pointers": []
            }))),
        ];
        let table = CycleTable::replay(&events).unwrap();
        let snap = table.cycle("unit-001").unwrap();
        assert_eq!(snap.state::<UnitMachine>().unwrap(), UnitState::HumanReviewGate);
        assert!(table.is_committed("units/unit-001/draft.v001.md"));
        assert!(!table.is_committed("units/unit-001/draft.v002.md"));
        assert_eq!(table.committed_pointer("unit_text/unit-001"), Some(1));
        assert_eq!(table.last_run(), Some("run-0001-aaaaaaaa"));
    }

    #[test]
    fn test_migration_steps_are_collected() {
        let run = RunId::parse("run-0001-aaaaaaaa").unwrap();
        let events = vec![(
            run,
            event(1, EventType::MigrationStep, json!({
                "proposal_id": "CP-20260101-0001", "step_id": "s1", "index": 0, "result_hash": "sha256:x"
            })),
        )];
        let table = CycleTable::replay(&events).unwrap();
        assert_eq!(table.migration_steps("CP-20260101-0001")["s1"], "sha256:x");
        assert!(table.migration_steps("CP-20260101-0002").is_empty());
    }

    #[test]
    fn test_bad_snapshot_is_corruption() {
        let run = RunId::parse("run-0001-aaaaaaaa").unwrap();
        let events = vec![(run, event(1, EventType::NodeEnd, json!({"snapshot": {"cycle": 3}})))];
        assert!(matches!(CycleTable::replay(&events), Err(EngineError::LogCorruption(_))));
    }
}
