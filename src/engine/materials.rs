//! Materials cycle: draft, agent review loop, human gate, freeze

use super::capability::{task, Role};
use super::fsm::{MaterialsAction, MaterialsMachine, MaterialsState};
use super::{CycleOutcome, CycleSnapshot, Engine, Work};
use crate::audit::{EventDraft, EventType};
use crate::error::{EngineError, EngineResult};
use crate::gate::{evaluate, freeze_predicates, GateKind};
use crate::models::materials::{apply_answers, conflicts, open_questions, set_meta, PACK_LAYERS};
use crate::models::{MaterialsDecision, ReviewReport, ReviewVerdict};
use crate::orchestrator::prompts;
use crate::store::{freeze_materials, Family, FreezeKind};
use serde_json::{json, Value};

pub(crate) const MATERIALS_CYCLE: &str = "materials";

/// Guard over author output: an object carrying all four layers
fn pack_guard(value: &Value) -> Result<Value, String> {
    let obj = value.as_object().ok_or("materials pack must be a JSON object")?;
    for layer in PACK_LAYERS {
        if !obj.get(layer).is_some_and(Value::is_object) {
            return Err(format!("materials pack is missing the '{}' layer", layer));
        }
    }
    Ok(value.clone())
}

fn materials_gate_id(n: u32) -> String {
    format!("materials-g{:02}", n)
}

impl Engine {
    pub(crate) fn run_materials(&mut self) -> EngineResult<CycleOutcome> {
        let result = self.drive_materials();
        self.guarded(MATERIALS_CYCLE, result)
    }

    fn drive_materials(&mut self) -> EngineResult<CycleOutcome> {
        let mut snap = self.snapshot::<MaterialsMachine>(MATERIALS_CYCLE, 0)?;
        let max_rounds = self.ctx.config.workflow.max_materials_review_rounds;
        loop {
            snap = match snap.state::<MaterialsMachine>()? {
                MaterialsState::Intake => {
                    self.transition::<MaterialsMachine>(&snap, MaterialsAction::Produce, |e, next| e.produce_draft(next))?
                }
                MaterialsState::Draft => {
                    self.transition::<MaterialsMachine>(&snap, MaterialsAction::Review, |e, next| e.review_draft(next))?
                }
                MaterialsState::AgentReviewLoop => {
                    let report = self.materials_review(snap.version)?;
                    if report.verdict == ReviewVerdict::NeedsChanges && snap.round < max_rounds {
                        let instructions: Vec<String> = report
                            .issues
                            .iter()
                            .map(|i| format!("{}: {}", i.id, i.description))
                            .collect();
                        self.transition::<MaterialsMachine>(&snap, MaterialsAction::NeedsAnotherRound, |e, next| {
                            e.revise_draft(next, &instructions)?;
                            e.review_draft(next)
                        })?
                    } else {
                        self.transition::<MaterialsMachine>(&snap, MaterialsAction::RequestHuman, |e, next| {
                            e.request_human(next, &report)
                        })?
                    }
                }
                MaterialsState::HumanReviewGate => match self.materials_gate(&snap)? {
                    Some(next) => next,
                    None => {
                        return Ok(CycleOutcome::AwaitingDecision {
                            gate_id: snap.gate_id.clone().unwrap_or_default(),
                        })
                    }
                },
                MaterialsState::Frozen => return Ok(CycleOutcome::Completed),
            };
        }
    }

    fn draft(&self, version: u32) -> EngineResult<Value> {
        self.store.read_json(&self.ctx.project, Family::MaterialsDraft, version)
    }

    fn materials_review(&self, version: u32) -> EngineResult<ReviewReport> {
        let value = self.store.read_json(&self.ctx.project, Family::MaterialsReview, version)?;
        ReviewReport::from_output(&value)
            .map_err(|e| EngineError::LogCorruption(format!("materials review v{:03}: {}", version, e)))
    }

    /// Write a new draft version and point the family at it
    fn put_draft(&mut self, work: &mut Work, next: &mut CycleSnapshot, mut pack: Value) -> EngineResult<()> {
        let version = next.version + 1;
        set_meta(&mut pack, "version", json!(version));
        set_meta(&mut pack, "status", json!("draft"));
        self.put_json(work, Family::MaterialsDraft, version, &pack)?;
        self.advance(work, Family::MaterialsDraft, version)?;
        next.version = version;
        Ok(())
    }

    fn produce_draft(&mut self, next: &mut CycleSnapshot) -> EngineResult<Work> {
        let brief_path = self.paths.brief_path();
        let brief = if brief_path.is_file() {
            std::fs::read_to_string(&brief_path)?
        } else {
            String::new()
        };
        let pack = self.call(
            Role::MaterialsAuthor,
            task::DRAFT_MATERIALS,
            0,
            0,
            prompts::draft_materials_prompt(self.ctx.project.as_str()),
            json!({ "brief": brief }),
            pack_guard,
        )?;
        let mut work = Work::default();
        next.version = 0;
        self.put_draft(&mut work, next, pack)?;
        Ok(work.field("draft_version", next.version))
    }

    fn review_draft(&mut self, next: &mut CycleSnapshot) -> EngineResult<Work> {
        let pack = self.draft(next.version)?;
        let round = next.round + 1;
        let report = self.call(
            Role::MaterialsReviewer,
            task::REVIEW_MATERIALS,
            0,
            round,
            prompts::review_materials_prompt(next.version, round),
            json!({ "pack": pack, "dod": evaluate(&pack) }),
            ReviewReport::from_output,
        )?;
        let mut work = Work::default();
        self.put_json(
            &mut work,
            Family::MaterialsReview,
            next.version,
            &serde_json::to_value(&report)?,
        )?;
        self.advance(&mut work, Family::MaterialsReview, next.version)?;
        next.round = round;
        Ok(work
            .field("draft_version", next.version)
            .field("round", round)
            .field("verdict", if report.verdict == ReviewVerdict::Pass { "pass" } else { "needs_changes" })
            .field("issues", report.issues.len() as u64))
    }

    fn revise_draft(&mut self, next: &mut CycleSnapshot, instructions: &[String]) -> EngineResult<Work> {
        let pack = self.draft(next.version)?;
        let revised = self.call(
            Role::MaterialsAuthor,
            task::REVISE_MATERIALS,
            0,
            next.round,
            prompts::revise_materials_prompt(next.version, instructions),
            json!({ "pack": pack, "instructions": instructions }),
            pack_guard,
        )?;
        let mut work = Work::default();
        self.put_draft(&mut work, next, revised)?;
        Ok(work)
    }

    /// Close the agent loop: log the findings a human needs and move to the gate
    fn request_human(&mut self, next: &mut CycleSnapshot, report: &ReviewReport) -> EngineResult<Work> {
        let pack = self.draft(next.version)?;
        for (id, q) in open_questions(&pack) {
            self.emit(
                EventDraft::new(EventType::OpenQuestion)
                    .phase(MATERIALS_CYCLE)
                    .field("id", id.as_str())
                    .field("question", q.question.as_str())
                    .field("severity", q.severity.as_str())
                    .field("blocking", q.is_open_blocker())
                    .field("resolved", q.resolved),
            )?;
        }
        for (id, c) in conflicts(&pack) {
            self.emit(
                EventDraft::new(EventType::ConflictDetected)
                    .phase(MATERIALS_CYCLE)
                    .field("id", id.as_str())
                    .field("description", c.description.as_str())
                    .field("resolved", c.resolved),
            )?;
        }
        let dod = evaluate(&pack);
        self.emit(
            EventDraft::new(EventType::ChecklistResult)
                .phase(MATERIALS_CYCLE)
                .field("draft_version", next.version)
                .field("summary", dod.summary_line())
                .field("passed", dod.passed())
                .field_json("issues", &dod.issues),
        )?;
        for issue in report.issues.iter().filter(|i| i.kind == "glossary") {
            self.emit(
                EventDraft::new(EventType::GlossaryDrift)
                    .phase(MATERIALS_CYCLE)
                    .field("issue_id", issue.id.as_str())
                    .field("description", issue.description.as_str())
                    .field_json("anchors", &issue.anchors),
            )?;
        }

        next.gates += 1;
        next.gate_id = Some(materials_gate_id(next.gates));
        Ok(Work::default()
            .field("draft_version", next.version)
            .field("dod", dod.summary_line()))
    }

    /// Wait on the materials gate and apply its decision
    fn materials_gate(&mut self, snap: &CycleSnapshot) -> EngineResult<Option<CycleSnapshot>> {
        let gate_id = snap
            .gate_id
            .clone()
            .ok_or_else(|| EngineError::LogCorruption("materials gate state without a gate id".to_string()))?;
        let pack = self.draft(snap.version)?;
        let references: Vec<String> = open_questions(&pack)
            .into_iter()
            .filter(|(_, q)| !q.resolved)
            .map(|(id, _)| id)
            .chain(conflicts(&pack).into_iter().filter(|(_, c)| !c.resolved).map(|(id, _)| id))
            .collect();
        self.open_gate(
            GateKind::Materials,
            &gate_id,
            snap,
            Family::MaterialsDraft.rel_path(snap.version),
            evaluate(&pack).summary_line(),
            references,
        )?;

        let Some(raw) = self.next_decision(&gate_id)? else {
            return Ok(None);
        };
        let decision = match MaterialsDecision::parse(&gate_id, &raw) {
            Ok(d) => d,
            Err(e) => return Err(self.refuse(&gate_id, &raw, e)),
        };

        // guards run before anything is recorded so a refused decision
        // leaves the gate open
        let guard = match &decision {
            MaterialsDecision::Freeze => {
                let (_, failed) = freeze_predicates(&pack);
                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(EngineError::BlockedGate {
                        gate: gate_id.clone(),
                        predicates: failed,
                    })
                }
            }
            MaterialsDecision::AnswerQuestions { answers } => {
                let known: Vec<String> = open_questions(&pack).into_iter().map(|(id, _)| id).collect();
                match answers.keys().find(|id| !known.contains(id)) {
                    Some(unknown) => Err(EngineError::InvalidDecision {
                        gate: gate_id.clone(),
                        action: raw.action.clone(),
                        expected: format!("answers for known open questions, '{}' is not one", unknown),
                    }),
                    None => Ok(()),
                }
            }
            MaterialsDecision::Revise { .. } => Ok(()),
        };
        if let Err(e) = guard {
            return Err(self.refuse(&gate_id, &raw, e));
        }

        let record = match &decision {
            MaterialsDecision::Freeze => self.record_gate(&gate_id, "freeze", &raw)?,
            MaterialsDecision::Revise { .. } => self.record_gate(&gate_id, "revise", &raw)?,
            MaterialsDecision::AnswerQuestions { .. } => self.record_gate(&gate_id, "answer_questions", &raw)?,
        };

        let next = match decision {
            MaterialsDecision::Freeze => {
                let next = self.transition::<MaterialsMachine>(snap, MaterialsAction::Freeze, |e, next| e.freeze(next))?;
                self.ctx.frozen_version = Some(next.version);
                self.snapshot_session(next.version)?;
                next
            }
            MaterialsDecision::Revise { instruction } => {
                self.transition::<MaterialsMachine>(snap, MaterialsAction::Revise, |e, next| {
                    next.round = 0;
                    let mut work = e.revise_draft(next, &[instruction])?;
                    let review = e.review_draft(next)?;
                    work.artifacts.extend(review.artifacts);
                    work.pointers.extend(review.pointers);
                    Ok(work.field("gate_id", record.request.gate_id.as_str()))
                })?
            }
            MaterialsDecision::AnswerQuestions { answers } => {
                self.transition::<MaterialsMachine>(snap, MaterialsAction::AnswerQuestions, |e, next| {
                    let mut pack = e.draft(next.version)?;
                    let applied = apply_answers(&mut pack, &answers);
                    let mut work = Work::default();
                    next.round = 0;
                    e.put_draft(&mut work, next, pack)?;
                    let review = e.review_draft(next)?;
                    work.artifacts.extend(review.artifacts);
                    work.pointers.extend(review.pointers);
                    Ok(work
                        .field("gate_id", record.request.gate_id.as_str())
                        .field("answered", applied as u64))
                })?
            }
        };
        Ok(Some(next))
    }

    fn freeze(&mut self, next: &mut CycleSnapshot) -> EngineResult<Work> {
        let caller = self.caller();
        let outcome = freeze_materials(&self.store, &mut self.anchors, &caller, next.version, FreezeKind::Initial)?;
        let mut work = Work::default();
        self.adopt(&mut work, outcome.artifacts, outcome.pointer)?;
        self.emit(
            EventDraft::new(EventType::FreezeCompleted)
                .phase(MATERIALS_CYCLE)
                .field("version", outcome.version)
                .field("anchors", outcome.anchors as u64)
                .field("dod", outcome.dod.summary_line()),
        )?;
        Ok(work
            .field("frozen_version", outcome.version)
            .field("anchors", outcome.anchors as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_guard_requires_layers() {
        let full = json!({"canon": {}, "planning": {}, "execution": {}, "risk": {}});
        assert!(pack_guard(&full).is_ok());
        let missing = json!({"canon": {}, "planning": {}, "execution": {}});
        assert!(pack_guard(&missing).unwrap_err().contains("risk"));
        assert!(pack_guard(&json!("text")).is_err());
    }

    #[test]
    fn test_gate_ids() {
        assert_eq!(materials_gate_id(1), "materials-g01");
        assert_eq!(materials_gate_id(12), "materials-g12");
    }
}
