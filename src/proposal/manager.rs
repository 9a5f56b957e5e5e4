//! Change proposal lifecycle
//!
//! A proposal is the only way to change materials after the first freeze.
//! It is validated at submission, reviewed by the advisor capability, decided
//! at a human gate, and on approval migrated and refrozen as a strictly
//! newer version. Rejected proposals end without touching anything.

use crate::audit::{EventDraft, EventType};
use crate::engine::capability::{task, Role};
use crate::engine::fsm::{Machine, ProposalAction, ProposalMachine, ProposalState};
use crate::engine::{CycleOutcome, CycleSnapshot, Engine, Work};
use crate::error::{EngineError, EngineResult};
use crate::gate::GateKind;
use crate::models::proposal::{proposal_id, validate_proposal_id, ProposalDecisionRecord};
use crate::models::{Evidence, ProposalDecision, ProposalInput, ProposalRecord, RawDecision};
use crate::orchestrator::prompts;
use crate::proposal::migration::apply_plan;
use crate::state::ProposalOutcome;
use crate::store::layout::{atomic_write, to_json_bytes};
use crate::store::Family;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

const PROPOSAL_FILE: &str = "proposal.json";
const ADVISOR_FILE: &str = "advisor_review.json";
const DECISION_FILE: &str = "human_decision.json";

/// `changes/<id>/advisor_review.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdvisorReview {
    pub recommendation: ProposalDecision,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub risks: Vec<String>,
}

fn advisor_guard(value: &serde_json::Value) -> Result<AdvisorReview, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("malformed advisor review: {}", e))
}

pub fn approval_gate_id(proposal_id: &str) -> String {
    format!("{}-approval", proposal_id)
}

/// Chapter a proposal is about, from its unit or issue evidence
fn evidence_chapter(evidence: &[Evidence]) -> u32 {
    evidence
        .iter()
        .find_map(|e| match e {
            Evidence::Unit(chapter) | Evidence::Issue { chapter, .. } => Some(*chapter),
            Evidence::Anchor(_) => None,
        })
        .unwrap_or(0)
}

pub struct ChangeProposalManager<'a> {
    engine: &'a mut Engine,
}

impl Engine {
    pub fn proposals(&mut self) -> ChangeProposalManager<'_> {
        ChangeProposalManager { engine: self }
    }
}

impl ChangeProposalManager<'_> {
    fn dir(&self, id: &str) -> EngineResult<PathBuf> {
        validate_proposal_id(id)?;
        self.engine.paths.change_dir(id)
    }

    fn read(&self, id: &str) -> EngineResult<Option<ProposalRecord>> {
        self.engine.paths.guard(&self.engine.ctx.project)?;
        let path = self.dir(id)?.join(PROPOSAL_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
    }

    /// Submitted proposal by id
    pub fn get(&self, id: &str) -> EngineResult<ProposalRecord> {
        match self.read(id)? {
            Some(record) if self.engine.cycles.is_submitted(id) => Ok(record),
            _ => Err(EngineError::NotFound(format!("proposal {}", id))),
        }
    }

    /// All submitted proposals, ordered by id
    pub fn list(&self) -> EngineResult<Vec<ProposalRecord>> {
        let dir = self.engine.paths.changes_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if validate_proposal_id(&name).is_err() || !self.engine.cycles.is_submitted(&name) {
                continue;
            }
            if let Some(record) = self.read(&name)? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub(crate) fn save(&self, record: &ProposalRecord) -> EngineResult<()> {
        self.engine.paths.guard(&self.engine.ctx.project)?;
        let dir = self.dir(&record.id)?;
        std::fs::create_dir_all(&dir)?;
        atomic_write(&dir.join(PROPOSAL_FILE), &to_json_bytes(record)?)
    }

    fn write_file<T: Serialize>(&self, id: &str, name: &str, value: &T) -> EngineResult<()> {
        atomic_write(&self.dir(id)?.join(name), &to_json_bytes(value)?)
    }

    /// Proposal opened for a continuation, finishing its submission when an
    /// earlier run saved it but never logged it
    pub fn find_by_continuation(&mut self, token: &str) -> EngineResult<Option<ProposalRecord>> {
        let dir = self.engine.paths.changes_dir();
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut names: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| validate_proposal_id(n).is_ok())
            .collect();
        names.sort();
        for name in names {
            let Some(record) = self.read(&name)? else {
                continue;
            };
            if record.continuation.as_deref() != Some(token) {
                continue;
            }
            if !self.engine.cycles.is_submitted(&record.id) {
                self.log_submitted(&record)?;
            }
            return Ok(Some(record));
        }
        Ok(None)
    }

    /// Next free `CP-YYYYMMDD-NNNN` for today
    fn allocate_id(&self) -> EngineResult<String> {
        let day = Utc::now().format("%Y%m%d").to_string();
        let prefix = format!("CP-{}-", day);
        let dir = self.engine.paths.changes_dir();
        let mut last = 0u32;
        if dir.is_dir() {
            for entry in std::fs::read_dir(dir)? {
                let name = entry?.file_name().to_string_lossy().to_string();
                if let Some(seq) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u32>().ok()) {
                    last = last.max(seq);
                }
            }
        }
        Ok(proposal_id(&day, last + 1))
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a proposal that is not tied to a suspended unit
    pub fn submit(&mut self, input: ProposalInput) -> EngineResult<ProposalRecord> {
        let chapter = evidence_chapter(&input.evidence);
        self.submit_with(input, None, chapter)
    }

    pub(crate) fn submit_with(
        &mut self,
        input: ProposalInput,
        continuation: Option<String>,
        chapter: u32,
    ) -> EngineResult<ProposalRecord> {
        let (frozen, pack) = self.engine.frozen_pack()?;
        self.validate(&input, frozen, &pack)?;
        self.engine.ctx.charge_proposal()?;

        let id = self.allocate_id()?;
        let record = ProposalRecord {
            id: id.clone(),
            project: self.engine.ctx.project.to_string(),
            created_at: Utc::now().to_rfc3339(),
            created_in_run: self.engine.ctx.run_id.to_string(),
            target_version: frozen,
            what: input.what.trim().to_string(),
            why: input.why.trim().to_string(),
            impact: input.impact,
            migration_plan: input.migration_plan,
            alternatives: input.alternatives,
            evidence: input.evidence,
            continuation,
            state: ProposalMachine::initial(),
            advisor_notes: None,
            decision: None,
            migration: None,
            halted: None,
        };
        self.save(&record)?;
        self.log_submitted(&record)?;
        tracing::info!(proposal = %id, target = frozen, chapter, "change proposal submitted");
        Ok(record)
    }

    fn validate(&self, input: &ProposalInput, frozen: u32, pack: &serde_json::Value) -> EngineResult<()> {
        if input.what.trim().is_empty() || input.why.trim().is_empty() {
            return Err(EngineError::InvalidProposal("'what' and 'why' are required".to_string()));
        }
        if input.evidence.is_empty() {
            return Err(EngineError::InvalidProposal(
                "at least one triggering evidence reference is required".to_string(),
            ));
        }
        if input.migration_plan.is_empty() {
            return Err(EngineError::InvalidProposal("migration plan is empty".to_string()));
        }
        let mut ids = HashSet::new();
        for step in &input.migration_plan {
            if step.id.trim().is_empty() || !ids.insert(step.id.as_str()) {
                return Err(EngineError::InvalidProposal(format!(
                    "migration step ids must be unique and non-empty ('{}')",
                    step.id
                )));
            }
        }
        apply_plan("dry-run", pack, &input.migration_plan, &BTreeMap::new())?;

        let caller = &self.engine.ctx.project;
        for evidence in &input.evidence {
            match evidence {
                Evidence::Anchor(anchor) => {
                    self.engine.anchors.resolve(caller, anchor, frozen)?;
                }
                Evidence::Unit(chapter) | Evidence::Issue { chapter, .. } => {
                    if self.engine.store.latest_version(caller, Family::UnitText(*chapter))?.is_none() {
                        return Err(EngineError::InvalidProposal(format!(
                            "evidence {} refers to a unit that was never produced",
                            evidence
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn log_submitted(&mut self, record: &ProposalRecord) -> EngineResult<()> {
        self.engine.emit(
            EventDraft::new(EventType::ProposalSubmitted)
                .phase("proposal")
                .chapter(evidence_chapter(&record.evidence))
                .field("proposal_id", record.id.as_str())
                .field("target_version", record.target_version)
                .field("what", record.what.as_str())
                .field("continuation", record.continuation.clone().unwrap_or_default())
                .field_json("evidence", &record.evidence)
                .payload("proposal", serde_json::to_string_pretty(record)?),
        )?;
        Ok(())
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Advance a proposal until it ends or waits on its approval gate
    pub fn drive(&mut self, id: &str) -> EngineResult<CycleOutcome> {
        let result = self.drive_inner(id);
        self.engine.guarded(id, result)
    }

    /// Drive every submitted proposal; ended ones only release their continuation
    pub(crate) fn drive_open(&mut self) -> EngineResult<Option<CycleOutcome>> {
        for record in self.list()? {
            let outcome = self.drive(&record.id)?;
            if outcome != CycleOutcome::Completed {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    /// Hand a decision for the proposal's approval gate to the engine and drive
    pub fn decide(&mut self, id: &str, raw: RawDecision) -> EngineResult<CycleOutcome> {
        self.engine.injected = Some((approval_gate_id(id), raw));
        let outcome = self.drive(id);
        self.engine.injected = None;
        outcome
    }

    pub fn approve(&mut self, id: &str, rationale: &str) -> EngineResult<CycleOutcome> {
        self.decide(id, RawDecision::new("approve").with_rationale(rationale))
    }

    pub fn reject(&mut self, id: &str, rationale: &str) -> EngineResult<CycleOutcome> {
        self.decide(id, RawDecision::new("reject").with_rationale(rationale))
    }

    fn drive_inner(&mut self, id: &str) -> EngineResult<CycleOutcome> {
        let mut record = self.get(id)?;
        let chapter = evidence_chapter(&record.evidence);
        let mut snap = self.engine.snapshot::<ProposalMachine>(id, chapter)?;
        loop {
            let state = snap.state::<ProposalMachine>()?;
            if record.state != state {
                record.state = state;
                self.save(&record)?;
            }
            snap = match state {
                ProposalState::DraftProposal => self.step(&snap, &mut record, ProposalAction::Advise)?,
                ProposalState::AdvisorReview => self.step(&snap, &mut record, ProposalAction::RequestDecision)?,
                ProposalState::HumanDecision => match self.approval(&snap, &mut record)? {
                    Some(next) => next,
                    None => {
                        return Ok(CycleOutcome::AwaitingDecision {
                            gate_id: approval_gate_id(id),
                        })
                    }
                },
                ProposalState::Migration => self.step(&snap, &mut record, ProposalAction::Migrate)?,
                ProposalState::ReFreeze => {
                    let next = self.step(&snap, &mut record, ProposalAction::Refreeze)?;
                    self.engine.snapshot_session(next.version)?;
                    next
                }
                ProposalState::Closed | ProposalState::Rejected => {
                    self.release(&record)?;
                    return Ok(CycleOutcome::Completed);
                }
            };
        }
    }

    /// Run one proposal transition and persist the record view of it
    fn step(&mut self, snap: &CycleSnapshot, record: &mut ProposalRecord, action: ProposalAction) -> EngineResult<CycleSnapshot> {
        let next = self.engine.transition::<ProposalMachine>(snap, action, |e, next| match action {
            ProposalAction::Advise => e.advise(record),
            ProposalAction::RequestDecision => {
                next.gates += 1;
                next.gate_id = Some(approval_gate_id(&record.id));
                Ok(Work::default())
            }
            ProposalAction::Approve | ProposalAction::Reject => e.conclude(record, action),
            ProposalAction::Migrate => {
                next.version = record.target_version;
                e.migrate(record, next)
            }
            ProposalAction::Refreeze => e.refreeze(record, next),
        })?;
        record.state = next.state::<ProposalMachine>()?;
        self.save(record)?;
        Ok(next)
    }

    /// Wait on the approval gate and apply its decision
    fn approval(&mut self, snap: &CycleSnapshot, record: &mut ProposalRecord) -> EngineResult<Option<CycleSnapshot>> {
        let gate_id = approval_gate_id(&record.id);
        let mut references: Vec<String> = record.evidence.iter().map(|e| e.to_string()).collect();
        references.extend(record.migration_plan.iter().map(|s| format!("step:{}", s.id)));
        self.engine.open_gate(
            GateKind::Proposal,
            &gate_id,
            snap,
            format!("changes/{}/{}", record.id, PROPOSAL_FILE),
            format!("{} (targets v{:03})", record.what, record.target_version),
            references,
        )?;

        let Some(raw) = self.engine.next_decision(&gate_id)? else {
            return Ok(None);
        };
        let decision = match ProposalDecision::parse(&gate_id, &raw) {
            Ok(d) => d,
            Err(e) => return Err(self.engine.refuse(&gate_id, &raw, e)),
        };
        if decision == ProposalDecision::Approve {
            let current = self.engine.store.frozen_version(&self.engine.ctx.project)?;
            if current != Some(record.target_version) {
                let err = EngineError::VersionConflict {
                    family: Family::MaterialsFrozen.key(),
                    version: record.target_version,
                };
                return Err(self.engine.refuse(&gate_id, &raw, err));
            }
        }

        let action_name = match decision {
            ProposalDecision::Approve => "approve",
            ProposalDecision::Reject => "reject",
        };
        let gate = self.engine.record_gate(&gate_id, action_name, &raw)?;
        record.decision = Some(ProposalDecisionRecord {
            decision,
            rationale: gate.decision.rationale.clone(),
            gate_id: gate_id.clone(),
            decided_at: gate.decided_at.clone(),
        });
        let action = match decision {
            ProposalDecision::Approve => ProposalAction::Approve,
            ProposalDecision::Reject => ProposalAction::Reject,
        };
        self.step(snap, record, action).map(Some)
    }

    /// Release the suspended unit behind an ended proposal. The first
    /// outcome recorded on the continuation wins.
    fn release(&mut self, record: &ProposalRecord) -> EngineResult<()> {
        let Some(token) = record.continuation.as_deref() else {
            return Ok(());
        };
        let outcome = match record.state {
            ProposalState::Closed => {
                let version = record
                    .migration
                    .as_ref()
                    .and_then(|m| m.new_frozen_version)
                    .ok_or_else(|| EngineError::LogCorruption(format!("{} closed without a refreeze", record.id)))?;
                ProposalOutcome::Applied {
                    new_frozen_version: version,
                }
            }
            ProposalState::Rejected => ProposalOutcome::Rejected {
                rationale: record
                    .decision
                    .as_ref()
                    .map(|d| d.rationale.clone())
                    .unwrap_or_default(),
            },
            _ => return Ok(()),
        };
        let caller = self.engine.caller();
        self.engine.continuations.release(&caller, token, outcome)?;
        Ok(())
    }
}

impl Engine {
    fn advise(&mut self, record: &mut ProposalRecord) -> EngineResult<Work> {
        let (frozen, materials) = self.frozen_pack()?;
        let chapter = evidence_chapter(&record.evidence);
        let review = self.call(
            Role::Advisor,
            task::REVIEW_PROPOSAL,
            chapter,
            0,
            prompts::review_proposal_prompt(&record.id, record.target_version),
            json!({ "proposal": record, "materials": materials, "frozen_version": frozen }),
            advisor_guard,
        )?;
        self.proposals().write_file(&record.id, ADVISOR_FILE, &review)?;
        record.advisor_notes = Some(review.notes.clone());
        self.emit(
            EventDraft::new(EventType::ProposalReviewed)
                .phase("proposal")
                .chapter(chapter)
                .field("proposal_id", record.id.as_str())
                .field_json("recommendation", &review.recommendation)
                .field_json("risks", &review.risks),
        )?;
        Ok(Work::default().field("recommendation", serde_json::to_value(&review.recommendation)?))
    }

    /// Write the human decision file and log the outcome
    fn conclude(&mut self, record: &mut ProposalRecord, action: ProposalAction) -> EngineResult<Work> {
        let decision = record
            .decision
            .clone()
            .ok_or_else(|| EngineError::LogCorruption(format!("{} concluded without a decision", record.id)))?;
        self.proposals().write_file(&record.id, DECISION_FILE, &decision)?;
        let event = if action == ProposalAction::Approve {
            EventType::ProposalApproved
        } else {
            EventType::ProposalRejected
        };
        self.emit(
            EventDraft::new(event)
                .phase("proposal")
                .chapter(evidence_chapter(&record.evidence))
                .field("proposal_id", record.id.as_str())
                .field("gate_id", decision.gate_id.as_str())
                .field("rationale", decision.rationale.as_str())
                .field("target_version", record.target_version),
        )?;
        Ok(Work::default())
    }
}
