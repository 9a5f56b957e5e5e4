//! Per-chapter unit cycle
//!
//! Draft, agent review and a human gate with four possible decisions. Only
//! `accept` leads to a memory deposit. `escalate` suspends the cycle behind
//! a continuation and hands control to a change proposal; the cycle picks
//! up again at a fresh gate once the proposal has ended.

use super::capability::{task, Role};
use super::fsm::{UnitAction, UnitMachine, UnitState};
use super::{CycleOutcome, CycleSnapshot, Engine, Work};
use crate::audit::{EventDraft, EventType};
use crate::error::{EngineError, EngineResult};
use crate::gate::{GateKind, GateRecord};
use crate::models::unit::unit_id;
use crate::models::{Evidence, HumanReviewRecord, MemoryRecord, ProposalInput, ReviewReport, UnitDecision};
use crate::orchestrator::prompts;
use crate::state::{Continuation, ContinuationStatus, ProposalOutcome};
use crate::store::{checksum, Family};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

/// Writer output
#[derive(Debug, Deserialize)]
struct UnitDraft {
    text: String,
    #[serde(default)]
    summary: String,
}

fn unit_draft_guard(value: &Value) -> Result<UnitDraft, String> {
    let draft: UnitDraft = serde_json::from_value(value.clone()).map_err(|e| format!("malformed unit draft: {}", e))?;
    if draft.text.trim().is_empty() {
        return Err("unit draft has no text".to_string());
    }
    Ok(draft)
}

fn proposal_guard(value: &Value) -> Result<ProposalInput, String> {
    let input: ProposalInput =
        serde_json::from_value(value.clone()).map_err(|e| format!("malformed proposal: {}", e))?;
    if input.what.trim().is_empty() || input.migration_plan.is_empty() {
        return Err("proposal needs a 'what' and a migration plan".to_string());
    }
    Ok(input)
}

fn unit_gate_id(chapter: u32, n: u32) -> String {
    format!("{}-g{:02}", unit_id(chapter), n)
}

enum Progress {
    Next(CycleSnapshot),
    Stop(CycleOutcome),
}

impl Engine {
    pub(crate) fn run_unit(&mut self, chapter: u32) -> EngineResult<CycleOutcome> {
        let cycle = unit_id(chapter);
        let result = self.drive_unit(&cycle, chapter);
        self.guarded(&cycle, result)
    }

    fn drive_unit(&mut self, cycle: &str, chapter: u32) -> EngineResult<CycleOutcome> {
        self.ctx.require_frozen()?;
        let mut snap = self.snapshot::<UnitMachine>(cycle, chapter)?;
        loop {
            snap = match snap.state::<UnitMachine>()? {
                UnitState::Draft => self.transition::<UnitMachine>(&snap, UnitAction::Write, |e, next| e.write_unit(next))?,
                UnitState::AgentReview => {
                    self.transition::<UnitMachine>(&snap, UnitAction::Review, |e, next| e.review_unit(next))?
                }
                UnitState::HumanReviewGate => match self.unit_gate(&snap)? {
                    Progress::Next(next) => next,
                    Progress::Stop(outcome) => return Ok(outcome),
                },
                UnitState::RewriteLoop => {
                    self.transition::<UnitMachine>(&snap, UnitAction::Rewrite, |e, next| e.rewrite_unit(next))?
                }
                UnitState::Deposit => {
                    self.transition::<UnitMachine>(&snap, UnitAction::DepositMemory, |e, next| e.deposit(next))?
                }
                UnitState::Suspended => match self.resume_unit(&snap)? {
                    Progress::Next(next) => next,
                    Progress::Stop(outcome) => return Ok(outcome),
                },
                UnitState::NextChapter => return Ok(CycleOutcome::Completed),
            };
        }
    }

    fn unit_text(&self, chapter: u32, round: u32) -> EngineResult<String> {
        self.store.read_text(&self.ctx.project, Family::UnitText(chapter), round)
    }

    fn unit_review(&self, chapter: u32, round: u32) -> EngineResult<ReviewReport> {
        let value = self.store.read_json(&self.ctx.project, Family::UnitReview(chapter), round)?;
        ReviewReport::from_output(&value)
            .map_err(|e| EngineError::LogCorruption(format!("{} review v{:03}: {}", unit_id(chapter), round, e)))
    }

    /// Latest human review record of a chapter
    fn unit_decision(&self, chapter: u32) -> EngineResult<HumanReviewRecord> {
        let family = Family::UnitDecision(chapter);
        let version = self
            .store
            .pointer(&self.ctx.project, family)?
            .ok_or_else(|| EngineError::NotFound(format!("decision record of {}", unit_id(chapter))))?;
        Ok(serde_json::from_value(self.store.read_json(&self.ctx.project, family, version)?)?)
    }

    fn materials_at(&self, version: u32) -> EngineResult<Value> {
        self.store.read_json(&self.ctx.project, Family::MaterialsFrozen, version)
    }

    fn put_unit_text(&mut self, work: &mut Work, chapter: u32, round: u32, text: &str) -> EngineResult<()> {
        let artifact = self.put_text(work, Family::UnitText(chapter), round, text)?;
        self.advance(work, Family::UnitText(chapter), round)?;
        work.fields.insert("text_hash".to_string(), json!(artifact.hash));
        Ok(())
    }

    // =========================================================================
    // Production
    // =========================================================================

    fn write_unit(&mut self, next: &mut CycleSnapshot) -> EngineResult<Work> {
        let (frozen, materials) = self.frozen_pack()?;
        let chapter = next.chapter;
        let draft = self.call(
            Role::Writer,
            task::WRITE_UNIT,
            chapter,
            1,
            prompts::write_unit_prompt(chapter, frozen),
            json!({ "chapter": chapter, "materials": materials }),
            unit_draft_guard,
        )?;
        let mut work = Work::default();
        self.put_unit_text(&mut work, chapter, 1, &draft.text)?;
        next.round = 1;
        next.version = frozen;
        Ok(work.field("frozen_version", frozen).field("summary", draft.summary))
    }

    fn review_unit(&mut self, next: &mut CycleSnapshot) -> EngineResult<Work> {
        let chapter = next.chapter;
        let text = self.unit_text(chapter, next.round)?;
        let materials = self.materials_at(next.version)?;
        let report = self.call(
            Role::Editor,
            task::REVIEW_UNIT,
            chapter,
            next.round,
            prompts::review_unit_prompt(chapter, next.round),
            json!({ "chapter": chapter, "text": text, "materials": materials }),
            ReviewReport::from_output,
        )?;
        let mut work = Work::default();
        self.put_json(&mut work, Family::UnitReview(chapter), next.round, &serde_json::to_value(&report)?)?;
        self.advance(&mut work, Family::UnitReview(chapter), next.round)?;
        next.gates += 1;
        next.gate_id = Some(unit_gate_id(chapter, next.gates));
        Ok(work
            .field("round", next.round)
            .field("issues", report.issues.len() as u64))
    }

    fn rewrite_unit(&mut self, next: &mut CycleSnapshot) -> EngineResult<Work> {
        let chapter = next.chapter;
        let record = self.unit_decision(chapter)?;
        let UnitDecision::RequestRewrite { instructions } = record.decision else {
            return Err(EngineError::LogCorruption(format!(
                "{} is rewriting without a request_rewrite decision",
                unit_id(chapter)
            )));
        };
        let text = self.unit_text(chapter, next.round)?;
        let review = self.unit_review(chapter, next.round)?;
        let materials = self.materials_at(next.version)?;
        let draft = self.call(
            Role::Writer,
            task::REWRITE_UNIT,
            chapter,
            next.round,
            prompts::rewrite_unit_prompt(chapter, next.round, &instructions),
            json!({
                "chapter": chapter,
                "text": text,
                "review": review,
                "instructions": instructions,
                "materials": materials,
            }),
            unit_draft_guard,
        )?;
        let round = next.round + 1;
        let mut work = Work::default();
        self.put_unit_text(&mut work, chapter, round, &draft.text)?;
        next.round = round;
        Ok(work.field("round", round))
    }

    fn deposit(&mut self, next: &mut CycleSnapshot) -> EngineResult<Work> {
        let chapter = next.chapter;
        let record = self.unit_decision(chapter)?;
        if record.decision != UnitDecision::Accept {
            return Err(EngineError::IllegalTransition {
                machine: "unit",
                state: "Deposit".to_string(),
                action: format!("deposit after {}", record.decision.action()),
            });
        }
        let text = self.unit_text(chapter, next.round)?;
        let review = self.unit_review(chapter, next.round)?;
        let memory = MemoryRecord {
            chapter,
            round: next.round,
            frozen_version: next.version,
            summary: review.summary,
            text_hash: checksum(text.as_bytes()),
            accepted_at: record.decided_at,
        };
        let mut work = Work::default();
        let artifact = self.put_json(&mut work, Family::Memory, chapter, &serde_json::to_value(&memory)?)?;
        self.emit(
            EventDraft::new(EventType::MemoryDeposited)
                .phase("unit")
                .chapter(chapter)
                .field("path", artifact.path.as_str())
                .field("round", next.round)
                .field("frozen_version", next.version),
        )?;
        Ok(work)
    }

    // =========================================================================
    // Human gate
    // =========================================================================

    fn unit_gate(&mut self, snap: &CycleSnapshot) -> EngineResult<Progress> {
        let chapter = snap.chapter;
        let gate_id = snap
            .gate_id
            .clone()
            .ok_or_else(|| EngineError::LogCorruption(format!("{} gate state without a gate id", snap.cycle)))?;
        let review = self.unit_review(chapter, snap.round)?;
        let mut references: Vec<String> = review.issues.iter().map(|i| i.id.clone()).collect();
        for issue in &review.issues {
            for anchor in &issue.anchors {
                if !references.contains(anchor) {
                    references.push(anchor.clone());
                }
            }
        }
        self.open_gate(
            GateKind::Unit,
            &gate_id,
            snap,
            Family::UnitText(chapter).rel_path(snap.round),
            review.summary.clone(),
            references,
        )?;

        let Some(raw) = self.next_decision(&gate_id)? else {
            return Ok(Progress::Stop(CycleOutcome::AwaitingDecision { gate_id }));
        };
        let decision = match UnitDecision::parse(&gate_id, &raw) {
            Ok(d) => d,
            Err(e) => return Err(self.refuse(&gate_id, &raw, e)),
        };

        let limit = self.ctx.config.workflow.max_rewrite_rounds;
        let guard = match &decision {
            UnitDecision::RequestRewrite { .. } if snap.round.saturating_sub(1) >= limit => {
                Err(EngineError::RewriteBudgetExhausted { chapter, limit })
            }
            UnitDecision::Escalate { .. } => self.ctx.check_proposal_budget(),
            UnitDecision::Waive { issues } => match issues.iter().find(|w| !review.has_issue(&w.issue_id)) {
                Some(unknown) => Err(EngineError::InvalidDecision {
                    gate: gate_id.clone(),
                    action: raw.action.clone(),
                    expected: format!("waived issues from the review, '{}' is not one", unknown.issue_id),
                }),
                None => Ok(()),
            },
            _ => Ok(()),
        };
        if let Err(e) = guard {
            return Err(self.refuse(&gate_id, &raw, e));
        }

        let record = self.record_gate(&gate_id, decision.action(), &raw)?;
        let action = match &decision {
            UnitDecision::Accept => UnitAction::Accept,
            UnitDecision::RequestRewrite { .. } => UnitAction::RequestRewrite,
            UnitDecision::Waive { .. } => UnitAction::Waive,
            UnitDecision::Escalate { .. } => UnitAction::Escalate,
        };
        let next = self.transition::<UnitMachine>(snap, action, |e, next| {
            let mut work = e.record_review(next, &record, decision.clone())?;
            if let UnitDecision::Escalate { reason, anchors } = &decision {
                let escalation = e.escalate(next, &record, reason, anchors)?;
                work.fields.extend(escalation.fields);
            }
            Ok(work.field("decision", decision.action()))
        })?;
        Ok(Progress::Next(next))
    }

    /// Keep the human review record for a decided gate
    fn record_review(&mut self, next: &mut CycleSnapshot, record: &GateRecord, decision: UnitDecision) -> EngineResult<Work> {
        let chapter = next.chapter;
        let review = HumanReviewRecord {
            chapter,
            round: next.round,
            frozen_version: next.version,
            decision,
            rationale: record.decision.rationale.clone(),
            references: record.decision.references.clone(),
            gate_id: record.request.gate_id.clone(),
            decided_at: record.decided_at.clone(),
        };
        let mut work = Work::default();
        self.put_json(&mut work, Family::UnitDecision(chapter), next.gates, &serde_json::to_value(&review)?)?;
        self.advance(&mut work, Family::UnitDecision(chapter), next.gates)?;
        Ok(work)
    }

    /// Suspend the cycle and open a change proposal for it
    fn escalate(
        &mut self,
        next: &mut CycleSnapshot,
        record: &GateRecord,
        reason: &str,
        anchors: &[crate::models::AnchorId],
    ) -> EngineResult<Work> {
        let caller = self.caller();
        let chapter = next.chapter;
        let gate_id = record.request.gate_id.as_str();
        let token = Continuation::token_for(gate_id);
        let continuation = match self.continuations.find(&caller, &token)? {
            Some(existing) => existing,
            None => {
                let fresh = Continuation {
                    token: token.clone(),
                    project: caller.to_string(),
                    cycle: next.cycle.clone(),
                    chapter,
                    suspended_state: UnitState::Suspended,
                    gate_id: gate_id.to_string(),
                    proposal_id: None,
                    created_at: Utc::now().to_rfc3339(),
                    status: ContinuationStatus::Suspended,
                };
                self.continuations.save(&caller, &fresh)?;
                fresh
            }
        };

        let proposal = match self.proposals().find_by_continuation(&token)? {
            Some(existing) => existing,
            None => {
                let (frozen, materials) = self.frozen_pack()?;
                let text = self.unit_text(chapter, next.round)?;
                let review = self.unit_review(chapter, next.round)?;
                let mut input = self.call(
                    Role::Advisor,
                    task::DRAFT_PROPOSAL,
                    chapter,
                    next.round,
                    prompts::draft_proposal_prompt(chapter, gate_id, reason),
                    json!({
                        "chapter": chapter,
                        "reason": reason,
                        "frozen_version": frozen,
                        "text": text,
                        "review": review,
                        "materials": materials,
                    }),
                    proposal_guard,
                )?;
                let mut evidence = vec![Evidence::Unit(chapter)];
                evidence.extend(anchors.iter().map(|a| Evidence::Anchor(*a)));
                for item in input.evidence.drain(..) {
                    if !evidence.contains(&item) {
                        evidence.push(item);
                    }
                }
                input.evidence = evidence;
                if input.why.trim().is_empty() {
                    input.why = reason.to_string();
                }
                self.proposals().submit_with(input, Some(token.clone()), chapter)?
            }
        };

        if continuation.proposal_id.as_deref() != Some(proposal.id.as_str()) {
            let mut linked = continuation;
            linked.proposal_id = Some(proposal.id.clone());
            self.continuations.save(&caller, &linked)?;
        }
        self.emit(
            EventDraft::new(EventType::UnitSuspended)
                .phase("unit")
                .chapter(chapter)
                .field("gate_id", gate_id)
                .field("continuation", token.as_str())
                .field("proposal_id", proposal.id.as_str()),
        )?;
        next.continuation = Some(token);
        Ok(Work::default().field("proposal_id", proposal.id))
    }

    /// Drive the blocking proposal and resume once it has ended
    fn resume_unit(&mut self, snap: &CycleSnapshot) -> EngineResult<Progress> {
        let caller = self.caller();
        let token = snap
            .continuation
            .clone()
            .ok_or_else(|| EngineError::LogCorruption(format!("{} suspended without a continuation", snap.cycle)))?;
        let continuation = self.continuations.load(&caller, &token)?;
        let proposal_id = continuation
            .proposal_id
            .clone()
            .ok_or_else(|| EngineError::NotFound(format!("proposal of continuation {}", token)))?;

        if continuation.outcome().is_none() {
            let outcome = self.proposals().drive(&proposal_id)?;
            if outcome != CycleOutcome::Completed {
                return Ok(Progress::Stop(outcome));
            }
        }
        let continuation = self.continuations.load(&caller, &token)?;
        let Some(outcome) = continuation.outcome().cloned() else {
            return Ok(Progress::Stop(CycleOutcome::Suspended { proposal_id }));
        };

        let next = self.transition::<UnitMachine>(snap, UnitAction::Resume, |e, next| {
            e.continuations.mark_resumed(&caller, &token)?;
            let (label, rationale) = match &outcome {
                ProposalOutcome::Applied { new_frozen_version } => {
                    next.version = *new_frozen_version;
                    ("applied", String::new())
                }
                ProposalOutcome::Rejected { rationale } => ("rejected", rationale.clone()),
            };
            next.continuation = None;
            next.gates += 1;
            next.gate_id = Some(unit_gate_id(next.chapter, next.gates));
            e.emit(
                EventDraft::new(EventType::UnitResumed)
                    .phase("unit")
                    .chapter(next.chapter)
                    .field("continuation", token.as_str())
                    .field("proposal_id", proposal_id.as_str())
                    .field("outcome", label)
                    .field("rationale", rationale)
                    .field("frozen_version", next.version),
            )?;
            Ok(Work::default().field("outcome", label))
        })?;
        Ok(Progress::Next(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_draft_guard() {
        assert!(unit_draft_guard(&json!({"text": "Once upon a time"})).is_ok());
        assert!(unit_draft_guard(&json!({"text": "  "})).is_err());
        assert!(unit_draft_guard(&json!({"summary": "no text"})).is_err());
    }

    #[test]
    fn test_proposal_guard_needs_plan() {
        let no_plan = json!({"what": "x", "why": "y", "impact": "z", "migration_plan": [], "evidence": []});
        assert!(proposal_guard(&no_plan).is_err());
        let ok = json!({
            "what": "allow rare magic", "why": "unit-002 needs it", "impact": "chapter 2",
            "migration_plan": [{"id": "s1", "op": "set", "path": "canon.world.magic", "value": "rare"}],
            "evidence": ["unit-002"]
        });
        assert_eq!(proposal_guard(&ok).unwrap().migration_plan.len(), 1);
    }

    #[test]
    fn test_unit_gate_ids() {
        assert_eq!(unit_gate_id(3, 2), "unit-003-g02");
    }
}
