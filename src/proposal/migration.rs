//! Migration and refreeze of an approved proposal
//!
//! Each migration step is applied to the frozen pack the proposal targets
//! and the hash of the intermediate pack is logged as a `migration_step`
//! event. Re-running the migration after a crash recomputes every step and
//! compares against the logged hashes: matching steps are skipped in the
//! log, a differing hash halts the proposal with a replay mismatch.

use crate::audit::{EventDraft, EventType};
use crate::engine::{CycleSnapshot, Engine, Work};
use crate::error::{EngineError, EngineResult};
use crate::models::materials::{push_changelog, set_meta};
use crate::models::proposal::MigrationOutcome;
use crate::models::{ChangelogEntry, MigrationStep, ProposalRecord};
use crate::store::layout::{atomic_write, to_json_bytes};
use crate::store::{checksum, freeze_materials, Family, FreezeKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    pub step_id: String,
    pub index: usize,
    /// Hash of the pack after this step
    pub result_hash: String,
    /// Step was already recorded by an earlier attempt
    pub replayed: bool,
}

/// `changes/<id>/migration_log.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationLog {
    pub proposal_id: String,
    pub base_version: u32,
    pub draft_version: u32,
    pub steps: Vec<StepResult>,
    pub applied_at: String,
}

/// Apply `plan` to `base`, checking each step against the hashes an earlier
/// attempt logged
pub fn apply_plan(
    proposal_id: &str,
    base: &Value,
    plan: &[MigrationStep],
    logged: &BTreeMap<String, String>,
) -> EngineResult<(Value, Vec<StepResult>)> {
    let mut pack = base.clone();
    let mut results = Vec::with_capacity(plan.len());
    for (index, step) in plan.iter().enumerate() {
        if let Err(detail) = step.apply(&mut pack) {
            return Err(if logged.contains_key(&step.id) {
                EngineError::MigrationReplayMismatch {
                    proposal_id: proposal_id.to_string(),
                    step: step.id.clone(),
                    detail,
                }
            } else {
                EngineError::InvalidProposal(format!("step '{}' cannot be applied: {}", step.id, detail))
            });
        }
        let result_hash = checksum(&to_json_bytes(&pack)?);
        let replayed = match logged.get(&step.id) {
            Some(previous) if *previous != result_hash => {
                return Err(EngineError::MigrationReplayMismatch {
                    proposal_id: proposal_id.to_string(),
                    step: step.id.clone(),
                    detail: format!("logged result {} but replay produced {}", previous, result_hash),
                });
            }
            Some(_) => true,
            None => false,
        };
        results.push(StepResult {
            step_id: step.id.clone(),
            index,
            result_hash,
            replayed,
        });
    }
    Ok((pack, results))
}

impl Engine {
    /// Apply the approved plan into a new materials draft
    pub(crate) fn migrate(&mut self, record: &mut ProposalRecord, next: &mut CycleSnapshot) -> EngineResult<Work> {
        let caller = self.caller();
        let current = self.store.frozen_version(&caller)?.ok_or(EngineError::NotFrozen)?;
        if current != record.target_version {
            return Err(EngineError::VersionConflict {
                family: Family::MaterialsFrozen.key(),
                version: record.target_version,
            });
        }
        let base = self.store.read_json(&caller, Family::MaterialsFrozen, record.target_version)?;
        let logged = self.cycles.migration_steps(&record.id);

        let (mut pack, steps) = match apply_plan(&record.id, &base, &record.migration_plan, &logged) {
            Ok(applied) => applied,
            Err(err) => {
                record.halted = Some(err.to_string());
                self.proposals().save(record)?;
                self.emit(
                    EventDraft::new(EventType::MigrationHalted)
                        .phase("proposal")
                        .field("proposal_id", record.id.as_str())
                        .field("category", err.category().name())
                        .field("error", err.to_string()),
                )?;
                return Err(err);
            }
        };
        for step in steps.iter().filter(|s| !s.replayed) {
            self.emit(
                EventDraft::new(EventType::MigrationStep)
                    .phase("proposal")
                    .field("proposal_id", record.id.as_str())
                    .field("step_id", step.step_id.as_str())
                    .field("index", step.index as u64)
                    .field("result_hash", step.result_hash.as_str()),
            )?;
        }
        let replayed = steps.iter().filter(|s| s.replayed).count();
        if replayed > 0 {
            tracing::info!(proposal = %record.id, replayed, "skipped already-applied migration steps");
        }

        let latest_draft = self.store.latest_version(&caller, Family::MaterialsDraft)?.unwrap_or(0);
        let draft_version = latest_draft.max(record.target_version) + 1;
        let applied_at = record
            .decision
            .as_ref()
            .map(|d| d.decided_at.clone())
            .unwrap_or_else(|| record.created_at.clone());
        set_meta(&mut pack, "version", json!(draft_version));
        set_meta(&mut pack, "status", json!("draft"));
        set_meta(&mut pack, "proposal_id", json!(record.id));
        push_changelog(
            &mut pack,
            &ChangelogEntry {
                version: draft_version,
                base_version: record.target_version,
                proposal_id: record.id.clone(),
                summary: record.what.clone(),
                applied_at: applied_at.clone(),
            },
        );

        let mut work = Work::default();
        self.put_json(&mut work, Family::MaterialsDraft, draft_version, &pack)?;
        self.advance(&mut work, Family::MaterialsDraft, draft_version)?;

        let log = MigrationLog {
            proposal_id: record.id.clone(),
            base_version: record.target_version,
            draft_version,
            steps: steps.clone(),
            applied_at,
        };
        atomic_write(
            &self.paths.change_dir(&record.id)?.join("migration_log.json"),
            &to_json_bytes(&log)?,
        )?;
        record.halted = None;
        record.migration = Some(MigrationOutcome {
            base_version: record.target_version,
            draft_version,
            new_frozen_version: None,
            applied_steps: steps.iter().map(|s| s.step_id.clone()).collect(),
        });
        self.emit(
            EventDraft::new(EventType::MigrationCompleted)
                .phase("proposal")
                .field("proposal_id", record.id.as_str())
                .field("base_version", record.target_version)
                .field("draft_version", draft_version)
                .field("steps", steps.len() as u64)
                .field("replayed", replayed as u64),
        )?;
        next.version = draft_version;
        Ok(work.field("draft_version", draft_version))
    }

    /// Freeze the migrated draft as the next frozen version
    pub(crate) fn refreeze(&mut self, record: &mut ProposalRecord, next: &mut CycleSnapshot) -> EngineResult<Work> {
        let caller = self.caller();
        let outcome = freeze_materials(
            &self.store,
            &mut self.anchors,
            &caller,
            next.version,
            FreezeKind::Refreeze {
                base_version: record.target_version,
            },
        )?;
        let mut work = Work::default();
        self.adopt(&mut work, outcome.artifacts, outcome.pointer)?;
        if let Some(migration) = record.migration.as_mut() {
            migration.new_frozen_version = Some(outcome.version);
        }
        self.ctx.frozen_version = Some(outcome.version);
        self.emit(
            EventDraft::new(EventType::RefreezeCompleted)
                .phase("proposal")
                .field("proposal_id", record.id.as_str())
                .field("version", outcome.version)
                .field("base_version", record.target_version)
                .field("anchors", outcome.anchors as u64)
                .field("dod", outcome.dod.summary_line()),
        )?;
        Ok(work.field("frozen_version", outcome.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MigrationOp;

    fn plan() -> Vec<MigrationStep> {
        vec![
            MigrationStep {
                id: "s1".to_string(),
                description: "allow rare magic".to_string(),
                op: MigrationOp::Set {
                    path: "canon.world.magic".to_string(),
                    value: json!("rare"),
                },
            },
            MigrationStep {
                id: "s2".to_string(),
                description: String::new(),
                op: MigrationOp::Append {
                    path: "canon.world.rules".to_string(),
                    value: json!({"name": "magic costs memory"}),
                },
            },
        ]
    }

    #[test]
    fn test_replay_skips_matching_steps() {
        let base = json!({"canon": {"world": {"rules": []}}});
        let (first, results) = apply_plan("CP-20260101-0001", &base, &plan(), &BTreeMap::new()).unwrap();
        assert!(results.iter().all(|r| !r.replayed));

        let logged: BTreeMap<String, String> = results
            .iter()
            .map(|r| (r.step_id.clone(), r.result_hash.clone()))
            .collect();
        let (second, replay) = apply_plan("CP-20260101-0001", &base, &plan(), &logged).unwrap();
        assert_eq!(first, second);
        assert!(replay.iter().all(|r| r.replayed));
    }

    #[test]
    fn test_diverged_base_is_a_mismatch() {
        let base = json!({"canon": {"world": {"rules": []}}});
        let (_, results) = apply_plan("CP-20260101-0001", &base, &plan(), &BTreeMap::new()).unwrap();
        let logged: BTreeMap<String, String> = results
            .into_iter()
            .map(|r| (r.step_id, r.result_hash))
            .collect();

        let edited = json!({"canon": {"world": {"rules": [{"name": "hand edit"}]}}});
        let err = apply_plan("CP-20260101-0001", &edited, &plan(), &logged).unwrap_err();
        match err {
            EngineError::MigrationReplayMismatch { step, .. } => assert_eq!(step, "s1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unappliable_step_is_invalid_before_anything_is_logged() {
        let base = json!({"canon": {}});
        let bad = vec![MigrationStep {
            id: "s1".to_string(),
            description: String::new(),
            op: MigrationOp::Remove {
                path: "canon.missing".to_string(),
            },
        }];
        assert!(matches!(
            apply_plan("CP-20260101-0001", &base, &bad, &BTreeMap::new()),
            Err(EngineError::InvalidProposal(_))
        ));
    }
}
