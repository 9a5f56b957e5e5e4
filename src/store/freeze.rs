//! Freezing a materials draft into an immutable frozen slot
//!
//! Freeze is the only place a [`CanonAuthority`] is minted. Initial freezes
//! come from the materials gate, later ones only from an approved change
//! proposal's refreeze step.

use crate::context::ProjectId;
use crate::error::{EngineError, EngineResult};
use crate::gate::dod::{self, DodReport};
use crate::models::materials::set_meta;
use crate::store::anchors::AnchorIndex;
use crate::store::artifact::{ArtifactRef, ArtifactStore, CanonAuthority, Family, PointerRef};
use crate::store::layout::checksum;
use serde_json::{json, Value};

/// Gate name reported when freeze predicates fail
pub const FREEZE_GATE: &str = "materials-freeze";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeKind {
    /// First freeze, from the materials human gate
    Initial,
    /// Refreeze of a migrated draft on top of `base_version`
    Refreeze { base_version: u32 },
}

#[derive(Debug, Clone)]
pub struct FreezeOutcome {
    pub version: u32,
    pub kind: FreezeKind,
    /// `false` when the frozen slot already held this draft
    pub created: bool,
    pub artifacts: Vec<ArtifactRef>,
    pub pointer: PointerRef,
    pub anchors: usize,
    pub dod: DodReport,
}

/// Freeze draft `version` into `frozen.v<version>`.
///
/// Validates the freeze predicates, assigns anchors, writes the frozen pack,
/// canon, anchor snapshot and DoD digest, then advances the frozen pointer.
/// Re-running a completed freeze of the same draft is a no-op.
pub fn freeze_materials(
    store: &ArtifactStore,
    anchors: &mut AnchorIndex,
    caller: &ProjectId,
    version: u32,
    kind: FreezeKind,
) -> EngineResult<FreezeOutcome> {
    let draft_bytes = store.read(caller, Family::MaterialsDraft, version)?;
    let source_hash = checksum(&draft_bytes);
    let draft: Value = serde_json::from_slice(&draft_bytes)?;

    let already = if store.exists(caller, Family::MaterialsFrozen, version)? {
        let frozen = store.read_json(caller, Family::MaterialsFrozen, version)?;
        if frozen["meta"]["source_hash"].as_str() != Some(source_hash.as_str()) {
            return Err(EngineError::VersionConflict {
                family: Family::MaterialsFrozen.key(),
                version,
            });
        }
        Some(frozen)
    } else {
        None
    };

    let current = store.frozen_version(caller)?;
    if already.is_none() {
        match (&kind, current) {
            (FreezeKind::Initial, Some(v)) => return Err(EngineError::AlreadyFrozen(v)),
            (FreezeKind::Refreeze { base_version }, cur) => {
                if cur != Some(*base_version) || version <= *base_version {
                    return Err(EngineError::VersionConflict {
                        family: Family::MaterialsFrozen.key(),
                        version,
                    });
                }
            }
            (FreezeKind::Initial, None) => {}
        }
    }

    let (report, failed) = dod::freeze_predicates(&draft);
    if !failed.is_empty() {
        tracing::warn!(version, failed = failed.len(), "freeze blocked");
        return Err(EngineError::BlockedGate {
            gate: FREEZE_GATE.to_string(),
            predicates: failed,
        });
    }

    let (frozen, anchor_count) = match already {
        Some(frozen) => {
            let count = anchors.bindings_at(version).len();
            (frozen, count)
        }
        None => {
            let mut pack = draft;
            let bindings = match anchors.assign(caller, &mut pack, version) {
                Ok(bindings) => bindings,
                Err(err) => {
                    anchors.reload()?;
                    return Err(err);
                }
            };
            set_meta(&mut pack, "version", json!(version));
            set_meta(&mut pack, "status", json!("frozen"));
            set_meta(&mut pack, "source_hash", json!(source_hash));
            if let FreezeKind::Refreeze { base_version } = kind {
                set_meta(&mut pack, "base_version", json!(base_version));
            }
            (pack, bindings.len())
        }
    };

    let mut created_slots = Vec::new();
    let written = write_frozen(store, anchors, caller, version, &frozen, &report, &mut created_slots);
    let (created, artifacts, pointer) = match written {
        Ok(written) => written,
        Err(err) => {
            undo_freeze(store, anchors, caller, version, current, &created_slots)?;
            return Err(err);
        }
    };
    tracing::info!(version, anchors = anchor_count, dod = %report.summary_line(), "materials frozen");

    Ok(FreezeOutcome {
        version,
        kind,
        created,
        artifacts,
        pointer,
        anchors: anchor_count,
        dod: report,
    })
}

/// Frozen pack, canon, anchor snapshot and digest, then the pointer and
/// finally the anchor registry
fn write_frozen(
    store: &ArtifactStore,
    anchors: &AnchorIndex,
    caller: &ProjectId,
    version: u32,
    frozen: &Value,
    report: &DodReport,
    created_slots: &mut Vec<Family>,
) -> EngineResult<(bool, Vec<ArtifactRef>, PointerRef)> {
    let authority = CanonAuthority::grant();
    let snapshot = serde_json::to_value(anchors.bindings_at(version))?;
    let digest = serde_json::to_value(report)?;
    let mut artifacts = Vec::new();
    let mut created = false;

    for family in [Family::MaterialsFrozen, Family::Canon, Family::AnchorSnapshot, Family::MaterialsDigest] {
        let outcome = match family {
            Family::MaterialsFrozen => store.write_json(caller, family, version, frozen)?,
            Family::Canon => store.write_canon(caller, &authority, version, frozen.get("canon").unwrap_or(&Value::Null))?,
            Family::AnchorSnapshot => store.write_json(caller, family, version, &snapshot)?,
            _ => store.write_json(caller, family, version, &digest)?,
        };
        if outcome.created {
            created_slots.push(family);
        }
        if family == Family::MaterialsFrozen {
            created = outcome.created;
        }
        artifacts.push(outcome.artifact);
    }

    let pointer = store.advance_pointer(caller, Family::MaterialsFrozen, version)?;
    anchors.save(caller)?;
    Ok((created, artifacts, pointer))
}

/// Put the store and registry back the way they were before a failed freeze
fn undo_freeze(
    store: &ArtifactStore,
    anchors: &mut AnchorIndex,
    caller: &ProjectId,
    version: u32,
    previous: Option<u32>,
    created_slots: &[Family],
) -> EngineResult<()> {
    if store.frozen_version(caller)? == Some(version) {
        match previous {
            Some(v) => {
                store.advance_pointer(caller, Family::MaterialsFrozen, v)?;
            }
            None => store.clear_pointer(caller, Family::MaterialsFrozen)?,
        }
    }
    let tag = format!("failed-freeze-v{:03}", version);
    for family in created_slots {
        store.quarantine(caller, *family, version, &tag)?;
    }
    anchors.reload()?;
    tracing::warn!(version, removed = created_slots.len(), "freeze rolled back");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnchorId;
    use crate::store::layout::Workspace;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(temp: &TempDir) -> (ArtifactStore, AnchorIndex, ProjectId) {
        let id = ProjectId::new("alpha").unwrap();
        let paths = Workspace::new(temp.path()).project(&id);
        paths.ensure_layout().unwrap();
        (ArtifactStore::open(paths.clone()), AnchorIndex::load(paths).unwrap(), id)
    }

    fn pack(blocker: bool) -> Value {
        json!({
            "meta": {"version": 1},
            "canon": {"world": {"rules": [{"name": "No magic"}]}, "characters": {}, "timeline": {}},
            "planning": {"outline": {"chapters": [{"title": "One"}]}, "tone": "dry"},
            "execution": {
                "decisions": [],
                "checklists": {},
                "glossary": {"places": [{"term": "Hollow"}]},
                "constraints": {"pov": {"rule": "single"}}
            },
            "risk": {"open_questions": [{"id": "OQ-001", "severity": "blocker", "resolved": !blocker}]}
        })
    }

    #[test]
    fn test_freeze_blocked_by_open_blocker() {
        let temp = TempDir::new().unwrap();
        let (store, mut anchors, id) = setup(&temp);
        store.write_json(&id, Family::MaterialsDraft, 1, &pack(true)).unwrap();

        let err = freeze_materials(&store, &mut anchors, &id, 1, FreezeKind::Initial).unwrap_err();
        match err {
            EngineError::BlockedGate { predicates, .. } => {
                assert_eq!(predicates[0].predicate, dod::PREDICATE_BLOCKERS);
                assert_eq!(predicates[0].details, vec!["OQ-001"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.frozen_version(&id).unwrap(), None);
        assert!(!store.exists(&id, Family::MaterialsFrozen, 1).unwrap());
    }

    #[test]
    fn test_freeze_writes_all_outputs_and_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let (store, mut anchors, id) = setup(&temp);
        store.write_json(&id, Family::MaterialsDraft, 1, &pack(false)).unwrap();

        let first = freeze_materials(&store, &mut anchors, &id, 1, FreezeKind::Initial).unwrap();
        assert!(first.created);
        assert_eq!(first.artifacts.len(), 4);
        assert_eq!(store.frozen_version(&id).unwrap(), Some(1));

        let frozen = store.read_json(&id, Family::MaterialsFrozen, 1).unwrap();
        assert_eq!(frozen["meta"]["status"], "frozen");
        assert_eq!(frozen["canon"]["world"]["rules"][0]["anchor"], "WR-001");
        let canon = store.read_json(&id, Family::Canon, 1).unwrap();
        assert_eq!(canon, frozen["canon"]);

        let again = freeze_materials(&store, &mut anchors, &id, 1, FreezeKind::Initial).unwrap();
        assert!(!again.created);
        assert_eq!(again.artifacts, first.artifacts);
    }

    #[test]
    fn test_second_initial_freeze_is_refused() {
        let temp = TempDir::new().unwrap();
        let (store, mut anchors, id) = setup(&temp);
        store.write_json(&id, Family::MaterialsDraft, 1, &pack(false)).unwrap();
        freeze_materials(&store, &mut anchors, &id, 1, FreezeKind::Initial).unwrap();

        let mut revised = pack(false);
        revised["planning"]["tone"] = json!("wry");
        store.write_json(&id, Family::MaterialsDraft, 2, &revised).unwrap();
        assert!(matches!(
            freeze_materials(&store, &mut anchors, &id, 2, FreezeKind::Initial),
            Err(EngineError::AlreadyFrozen(1))
        ));

        let refrozen = freeze_materials(&store, &mut anchors, &id, 2, FreezeKind::Refreeze { base_version: 1 }).unwrap();
        assert_eq!(refrozen.version, 2);
        assert_eq!(store.frozen_version(&id).unwrap(), Some(2));
        assert!(matches!(
            freeze_materials(&store, &mut anchors, &id, 2, FreezeKind::Refreeze { base_version: 2 }),
            Ok(_)
        ));
    }

    #[test]
    fn test_failed_freeze_leaves_no_anchor_bindings() {
        let temp = TempDir::new().unwrap();
        let (store, mut anchors, id) = setup(&temp);
        store.write_json(&id, Family::MaterialsDraft, 1, &pack(false)).unwrap();
        // an occupied digest slot makes the freeze fail after anchors were assigned
        store
            .write_json(&id, Family::MaterialsDigest, 1, &json!({"stale": true}))
            .unwrap();

        let err = freeze_materials(&store, &mut anchors, &id, 1, FreezeKind::Initial).unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict { .. }));
        assert_eq!(store.frozen_version(&id).unwrap(), None);
        assert!(!store.exists(&id, Family::MaterialsFrozen, 1).unwrap());
        assert!(!store.exists(&id, Family::AnchorSnapshot, 1).unwrap());

        let wr1: AnchorId = "WR-001".parse().unwrap();
        assert!(!anchors.contains(&wr1));
        assert!(anchors.resolve(&id, &wr1, 1).is_err());
        let on_disk = AnchorIndex::load(Workspace::new(temp.path()).project(&id)).unwrap();
        assert!(on_disk.resolve(&id, &wr1, 1).is_err());
        assert!(on_disk.bindings_at(1).is_empty());
    }
}
