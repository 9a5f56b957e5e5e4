//! Human gates
//!
//! An open gate is a pending request file `gates/<id>.yaml`. A decision
//! arrives through a [`DecisionSource`]; once recorded it is kept in
//! `gates/<id>.record.yaml` and the request is closed. A recorded decision
//! is returned again on replay so an interrupted transition re-runs with the
//! same decision and timestamp.

use crate::audit::{AuditLog, EventDraft, EventType};
use crate::context::ProjectId;
use crate::error::{EngineError, EngineResult, FailedPredicate};
use crate::models::{MaterialsDecision, ProposalDecision, RawDecision, UnitDecision};
use crate::store::layout::{atomic_write, validate_segment, ProjectPaths};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Materials,
    Unit,
    Proposal,
}

impl GateKind {
    pub fn vocabulary(&self) -> &'static [&'static str] {
        match self {
            GateKind::Materials => &MaterialsDecision::VOCABULARY,
            GateKind::Unit => &UnitDecision::VOCABULARY,
            GateKind::Proposal => &ProposalDecision::VOCABULARY,
        }
    }

    /// Parse the decision against this gate's vocabulary and return the action name
    pub fn validate(&self, gate_id: &str, raw: &RawDecision) -> EngineResult<&'static str> {
        match self {
            GateKind::Materials => Ok(match MaterialsDecision::parse(gate_id, raw)? {
                MaterialsDecision::Freeze => "freeze",
                MaterialsDecision::Revise { .. } => "revise",
                MaterialsDecision::AnswerQuestions { .. } => "answer_questions",
            }),
            GateKind::Unit => Ok(UnitDecision::parse(gate_id, raw)?.action()),
            GateKind::Proposal => Ok(match ProposalDecision::parse(gate_id, raw)? {
                ProposalDecision::Approve => "approve",
                ProposalDecision::Reject => "reject",
            }),
        }
    }
}

/// Pending gate request, persisted while the gate is open
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateRequest {
    pub gate_id: String,
    pub kind: GateKind,
    /// Cycle the gate belongs to (`materials`, `unit-003`, a proposal id)
    pub cycle: String,
    pub chapter: u32,
    pub round: u32,
    /// Project-relative path of the artifact under review
    pub subject: String,
    #[serde(default)]
    pub summary: String,
    /// Anchors, issue ids and findings shown to the reviewer
    #[serde(default)]
    pub references: Vec<String>,
    pub vocabulary: Vec<String>,
    pub opened_at: String,
    pub run_id: String,
}

/// Decided gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateRecord {
    pub request: GateRequest,
    pub action: String,
    pub decision: RawDecision,
    pub decided_at: String,
    pub decided_in_run: String,
}

/// Where human decisions come from
pub trait DecisionSource {
    /// Decision for an open gate, `None` while the human has not answered
    fn poll(&mut self, gate: &GateRequest) -> EngineResult<Option<RawDecision>>;

    /// The decision for `gate_id` was consumed (recorded or refused)
    fn consumed(&mut self, _gate_id: &str) -> EngineResult<()> {
        Ok(())
    }
}

fn decision_file(paths: &ProjectPaths, gate_id: &str) -> EngineResult<PathBuf> {
    validate_segment(gate_id)?;
    Ok(paths.gates_dir().join(format!("{}.decision.yaml", gate_id)))
}

/// Reads `gates/<id>.decision.yaml`, written by `inkgate decide` or by hand
#[derive(Debug, Clone)]
pub struct FileDecisionSource {
    paths: ProjectPaths,
}

impl FileDecisionSource {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }
}

impl DecisionSource for FileDecisionSource {
    fn poll(&mut self, gate: &GateRequest) -> EngineResult<Option<RawDecision>> {
        let path = decision_file(&self.paths, &gate.gate_id)?;
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&content)?))
    }

    fn consumed(&mut self, gate_id: &str) -> EngineResult<()> {
        let path = decision_file(&self.paths, gate_id)?;
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Validate `raw` against the open gate and drop it where the engine picks it up
pub fn write_decision_file(paths: &ProjectPaths, caller: &ProjectId, gate_id: &str, raw: &RawDecision) -> EngineResult<PathBuf> {
    paths.guard(caller)?;
    let controller = GateController::new(paths.clone());
    let request = controller
        .get(caller, gate_id)?
        .ok_or_else(|| EngineError::NotFound(format!("open gate {}", gate_id)))?;
    request.kind.validate(gate_id, raw)?;
    let path = decision_file(paths, gate_id)?;
    atomic_write(&path, serde_yaml::to_string(raw)?.as_bytes())?;
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct GateController {
    paths: ProjectPaths,
}

impl GateController {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    fn request_path(&self, gate_id: &str) -> EngineResult<PathBuf> {
        validate_segment(gate_id)?;
        Ok(self.paths.gates_dir().join(format!("{}.yaml", gate_id)))
    }

    fn record_path(&self, gate_id: &str) -> EngineResult<PathBuf> {
        validate_segment(gate_id)?;
        Ok(self.paths.gates_dir().join(format!("{}.record.yaml", gate_id)))
    }

    /// Open a gate; re-opening an already open or decided gate is a no-op
    pub fn open_gate(&self, caller: &ProjectId, log: &mut AuditLog, request: GateRequest) -> EngineResult<()> {
        self.paths.guard(caller)?;
        let path = self.request_path(&request.gate_id)?;
        if path.is_file() || self.record_path(&request.gate_id)?.is_file() {
            tracing::debug!(gate = %request.gate_id, "gate already open");
            return Ok(());
        }
        atomic_write(&path, serde_yaml::to_string(&request)?.as_bytes())?;
        log.append(
            caller,
            EventDraft::new(EventType::GateOpen)
                .phase(phase_of(request.kind))
                .chapter(request.chapter)
                .node(format!("gate.{}", request.gate_id))
                .field("gate_id", request.gate_id.as_str())
                .field("kind", phase_of(request.kind))
                .field("subject", request.subject.as_str())
                .field("round", request.round)
                .field("vocabulary", request.vocabulary.join("|"))
                .field_json("references", &request.references),
        )?;
        tracing::info!(gate = %request.gate_id, subject = %request.subject, "gate opened, awaiting decision");
        Ok(())
    }

    /// Open gate by id
    pub fn get(&self, caller: &ProjectId, gate_id: &str) -> EngineResult<Option<GateRequest>> {
        self.paths.guard(caller)?;
        let path = self.request_path(gate_id)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(serde_yaml::from_str(&std::fs::read_to_string(path)?)?))
    }

    pub fn record(&self, caller: &ProjectId, gate_id: &str) -> EngineResult<Option<GateRecord>> {
        self.paths.guard(caller)?;
        let path = self.record_path(gate_id)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(serde_yaml::from_str(&std::fs::read_to_string(path)?)?))
    }

    /// All open gates, ordered by id
    pub fn pending(&self, caller: &ProjectId) -> EngineResult<Vec<GateRequest>> {
        self.paths.guard(caller)?;
        let dir = self.paths.gates_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_suffix(".yaml") else {
                continue;
            };
            if id.ends_with(".record") || id.ends_with(".decision") {
                continue;
            }
            out.push(serde_yaml::from_str::<GateRequest>(&std::fs::read_to_string(&path)?)?);
        }
        out.sort_by(|a, b| a.gate_id.cmp(&b.gate_id));
        Ok(out)
    }

    /// Next decision for a gate: the recorded one if any, else whatever the
    /// source holds
    pub fn poll(
        &self,
        caller: &ProjectId,
        source: &mut dyn DecisionSource,
        gate_id: &str,
    ) -> EngineResult<Option<RawDecision>> {
        if let Some(record) = self.record(caller, gate_id)? {
            return Ok(Some(record.decision));
        }
        match self.get(caller, gate_id)? {
            Some(request) => source.poll(&request),
            None => Err(EngineError::NotFound(format!("gate {}", gate_id))),
        }
    }

    /// Record a validated decision and close the gate. Idempotent: a gate
    /// that already has a record returns it unchanged.
    pub fn record_decision(
        &self,
        caller: &ProjectId,
        log: &mut AuditLog,
        source: &mut dyn DecisionSource,
        gate_id: &str,
        action: &str,
        raw: &RawDecision,
    ) -> EngineResult<GateRecord> {
        if let Some(existing) = self.record(caller, gate_id)? {
            return Ok(existing);
        }
        let request = self
            .get(caller, gate_id)?
            .ok_or_else(|| EngineError::NotFound(format!("gate {}", gate_id)))?;
        let record = GateRecord {
            action: action.to_string(),
            decision: raw.clone(),
            decided_at: Utc::now().to_rfc3339(),
            decided_in_run: log.run_id().to_string(),
            request,
        };
        atomic_write(&self.record_path(gate_id)?, serde_yaml::to_string(&record)?.as_bytes())?;
        std::fs::remove_file(self.request_path(gate_id)?)?;
        source.consumed(gate_id)?;

        log.append(
            caller,
            EventDraft::new(EventType::GateDecision)
                .phase(phase_of(record.request.kind))
                .chapter(record.request.chapter)
                .node(format!("gate.{}", gate_id))
                .field("gate_id", gate_id)
                .field("action", action)
                .field("rationale", raw.rationale.as_str())
                .field_json("references", &raw.references)
                .field_json("issues", &raw.issues),
        )?;
        tracing::info!(gate = %gate_id, action, "decision recorded");
        Ok(record)
    }

    /// Refuse a decision that failed validation or a guard. The gate stays open.
    pub fn refuse(
        &self,
        caller: &ProjectId,
        log: &mut AuditLog,
        source: &mut dyn DecisionSource,
        gate: &GateRequest,
        raw: &RawDecision,
        err: &EngineError,
    ) -> EngineResult<()> {
        source.consumed(&gate.gate_id)?;
        let predicates: Vec<FailedPredicate> = match err {
            EngineError::BlockedGate { predicates, .. } => predicates.clone(),
            other => vec![FailedPredicate {
                predicate: other.category().name().to_string(),
                details: vec![other.to_string()],
            }],
        };
        log.append(
            caller,
            EventDraft::new(EventType::GateBlocked)
                .phase(phase_of(gate.kind))
                .chapter(gate.chapter)
                .node(format!("gate.{}", gate.gate_id))
                .field("gate_id", gate.gate_id.as_str())
                .field("action", raw.action.as_str())
                .field_json("predicates", &predicates),
        )?;
        tracing::warn!(gate = %gate.gate_id, action = %raw.action, error = %err, "decision refused");
        Ok(())
    }
}

fn phase_of(kind: GateKind) -> &'static str {
    match kind {
        GateKind::Materials => "materials",
        GateKind::Unit => "unit",
        GateKind::Proposal => "proposal",
    }
}
