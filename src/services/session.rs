//! Per-run session area
//!
//! `session/<run>/materials_snapshot/` holds a read-only copy of the frozen
//! materials in effect for the run. It is scratch space and is rebuilt on
//! every refreeze; nothing ever reads it back as a source of truth.

use crate::context::{ProjectId, RunId};
use crate::error::EngineResult;
use crate::store::{ArtifactStore, Family};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SNAPSHOT_DIR: &str = "materials_snapshot";
pub const VERSION_FILE: &str = "current_frozen_version.txt";

fn set_readonly(path: &Path, readonly: bool) -> EngineResult<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(readonly);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

fn clear(dir: &Path) -> EngineResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            set_readonly(entry.path(), false)?;
        }
    }
    std::fs::remove_dir_all(dir)?;
    Ok(())
}

/// Copy frozen `version`, its anchor snapshot and a version marker into the
/// run's session area
pub fn snapshot_materials(store: &ArtifactStore, caller: &ProjectId, run: &RunId, version: u32) -> EngineResult<PathBuf> {
    let paths = store.paths();
    paths.guard(caller)?;
    let dir = paths.session_dir(run).join(SNAPSHOT_DIR);
    clear(&dir)?;
    std::fs::create_dir_all(&dir)?;

    let mut copied = Vec::new();
    for family in [Family::MaterialsFrozen, Family::AnchorSnapshot, Family::MaterialsDigest] {
        if !store.exists(caller, family, version)? {
            continue;
        }
        let source = store.slot_path(family, version)?;
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = dir.join(name);
        std::fs::copy(&source, &target)?;
        copied.push(target);
    }
    let marker = dir.join(VERSION_FILE);
    std::fs::write(&marker, format!("{}\n", version))?;
    copied.push(marker);

    for file in &copied {
        set_readonly(file, true)?;
    }
    tracing::debug!(run = %run, version, files = copied.len(), "session materials snapshot written");
    Ok(dir)
}

/// Frozen version recorded in a run's session snapshot
pub fn snapshot_version(store: &ArtifactStore, run: &RunId) -> Option<u32> {
    let marker = store.paths().session_dir(run).join(SNAPSHOT_DIR).join(VERSION_FILE);
    std::fs::read_to_string(marker).ok()?.trim().parse().ok()
}
