//! Stage archives
//!
//! Copies a run's log directory and session area into
//! `stages/<stage>/<timestamp>-<run>/`. Archiving never happens without
//! explicit consent.

use crate::context::{ProjectId, RunId};
use crate::error::{EngineError, EngineResult};
use crate::store::layout::validate_segment;
use crate::store::ProjectPaths;
use chrono::Utc;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub path: PathBuf,
    pub files: usize,
}

fn copy_tree(from: &Path, to: &Path) -> EngineResult<usize> {
    let mut files = 0;
    for entry in WalkDir::new(from).into_iter().filter_map(|e| e.ok()) {
        let Ok(rel) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}

pub fn archive_run(
    paths: &ProjectPaths,
    caller: &ProjectId,
    run: &RunId,
    stage: &str,
    consent: bool,
) -> EngineResult<ArchiveOutcome> {
    if !consent {
        return Err(EngineError::ConsentRequired(format!("archive {}", run)));
    }
    paths.guard(caller)?;
    validate_segment(stage)?;

    let run_dir = paths.run_dir(run);
    if !run_dir.is_dir() {
        return Err(EngineError::NotFound(format!("run {}", run)));
    }
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let dest = paths.stages_dir().join(stage).join(format!("{}-{}", stamp, run));
    std::fs::create_dir_all(&dest)?;

    let mut files = copy_tree(&run_dir, &dest.join("run"))?;
    let session = paths.session_dir(run);
    if session.is_dir() {
        files += copy_tree(&session, &dest.join("session"))?;
    }
    tracing::info!(run = %run, stage, files, dest = %dest.display(), "run archived");
    Ok(ArchiveOutcome { path: dest, files })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Workspace;
    use tempfile::TempDir;

    #[test]
    fn test_archive_needs_consent_and_copies_run() {
        let temp = TempDir::new().unwrap();
        let project = ProjectId::new("alpha").unwrap();
        let paths = Workspace::new(temp.path()).project(&project);
        paths.ensure_layout().unwrap();
        let run = RunId::new(1);
        std::fs::create_dir_all(paths.run_dir(&run).join("payloads")).unwrap();
        std::fs::write(paths.run_dir(&run).join("events.jsonl"), "{}\n").unwrap();
        std::fs::write(paths.run_dir(&run).join("payloads").join("p.txt"), "x").unwrap();

        let refused = archive_run(&paths, &project, &run, "stage1", false).unwrap_err();
        assert!(matches!(refused, EngineError::ConsentRequired(_)));

        let outcome = archive_run(&paths, &project, &run, "stage1", true).unwrap();
        assert_eq!(outcome.files, 2);
        assert!(outcome.path.join("run").join("payloads").join("p.txt").is_file());
        assert!(outcome.path.starts_with(paths.stages_dir().join("stage1")));
    }
}
