//! Start-of-run recovery
//!
//! Slots on disk that no committed transition recorded were written by a
//! transition that never finished. They are moved to
//! `quarantine/<run>/` and every pointer goes back to its last committed
//! value, so the interrupted transition re-runs from a clean slate.

use super::Engine;
use crate::audit::{EventDraft, EventType};
use crate::error::EngineResult;
use crate::store::Family;
use std::collections::BTreeSet;

impl Engine {
    pub(crate) fn recover(&mut self) -> EngineResult<()> {
        let caller = self.caller();
        let tag = self.ctx.run_id.to_string();
        let mut families: BTreeSet<Family> = self
            .cycles
            .pointer_families()
            .filter_map(|key| Family::parse_key(key))
            .collect();

        let mut quarantined = 0usize;
        for (family, version) in self.store.all_slots(&caller)? {
            families.insert(family);
            if self.cycles.is_committed(&family.rel_path(version)) {
                continue;
            }
            let to = self.store.quarantine(&caller, family, version, &tag)?;
            self.emit(
                EventDraft::new(EventType::ArtifactQuarantined)
                    .field("family", family.key())
                    .field("version", version)
                    .field("moved_to", self.paths.relative(&to).unwrap_or_default())
                    .field("reason", "uncommitted"),
            )?;
            quarantined += 1;
        }

        let restored = self.restore_pointers(families)?;
        let unbound = self.rollback_anchors()?;
        if quarantined > 0 || restored > 0 || unbound > 0 {
            tracing::warn!(quarantined, restored, unbound, "recovered from an interrupted run");
        }
        Ok(())
    }

    /// Drop unsaved anchor changes and any binding past the committed frozen
    /// version, and bring the run context back in line with the pointer
    pub(crate) fn rollback_anchors(&mut self) -> EngineResult<usize> {
        let caller = self.caller();
        let frozen = self.store.frozen_version(&caller)?;
        self.anchors.reload()?;
        let dropped = self.anchors.rollback_to(&caller, frozen)?;
        self.ctx.frozen_version = frozen;
        Ok(dropped)
    }

    /// Put each family's pointer back to its last committed version, or
    /// remove it when nothing was ever committed. Returns how many moved.
    pub(crate) fn restore_pointers(&mut self, families: impl IntoIterator<Item = Family>) -> EngineResult<usize> {
        let caller = self.caller();
        let mut restored = 0;
        for family in families {
            let committed = self.cycles.committed_pointer(&family.key());
            let current = self.store.pointer(&caller, family)?;
            if current == committed {
                continue;
            }
            match committed {
                Some(version) => {
                    self.store.advance_pointer(&caller, family, version)?;
                }
                None => self.store.clear_pointer(&caller, family)?,
            }
            tracing::info!(family = %family, from = ?current, to = ?committed, "pointer restored");
            restored += 1;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::read_events;
    use crate::context::ProjectId;
    use crate::engine::capability::{Capability, CapabilityError, CapabilityOutput, CapabilityRequest};
    use crate::engine::Engine;
    use crate::gate::FileDecisionSource;
    use crate::models::EngineConfig;
    use crate::store::{ArtifactStore, Family, Workspace};
    use tempfile::TempDir;

    struct Silent;

    impl Capability for Silent {
        fn generate(&self, _request: &CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
            Err(CapabilityError::Fatal("not used".to_string()))
        }
    }

    #[test]
    fn test_uncommitted_slots_are_quarantined() {
        let temp = TempDir::new().unwrap();
        let workspace = Workspace::new(temp.path());
        let project = ProjectId::new("alpha").unwrap();
        let paths = workspace.project(&project);
        paths.ensure_layout().unwrap();

        // a crashed transition left a draft and a pointer behind
        let store = ArtifactStore::open(paths.clone());
        store
            .write_json(&project, Family::MaterialsDraft, 1, &serde_json::json!({"canon": {}}))
            .unwrap();
        store.advance_pointer(&project, Family::MaterialsDraft, 1).unwrap();

        let engine = Engine::start(
            &workspace,
            project.clone(),
            EngineConfig::default(),
            Box::new(Silent),
            Box::new(FileDecisionSource::new(paths.clone())),
        )
        .unwrap();

        assert!(!store.exists(&project, Family::MaterialsDraft, 1).unwrap());
        assert_eq!(store.pointer(&project, Family::MaterialsDraft).unwrap(), None);
        let moved = paths
            .quarantine_dir()
            .join(engine.run_id().as_str())
            .join(Family::MaterialsDraft.rel_path(1));
        assert!(moved.is_file());

        let events = read_events(&paths, &project, engine.run_id()).unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == crate::audit::EventType::ArtifactQuarantined));
    }
}
