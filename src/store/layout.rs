//! On-disk layout of a workspace and its projects
//!
//! ```text
//! <workspace>/
//!   inkgate.toml
//!   projects/<project>/
//!     canon/            canon.vNNN.json (written by freeze and migration only)
//!     materials/        drafts/ frozen/ reviews/ digests/ anchors/ index.json
//!     units/unit-NNN/   text, review and decision slots per round
//!     memory/           deposited unit memory
//!     changes/<CP-id>/  proposal.json advisor_review.json human_decision.json migration_log.json
//!     gates/            pending gates and decision files
//!     state/            continuations
//!     runs/<run>/       events.jsonl events.index.jsonl payloads/ run_meta.json
//!     session/<run>/    disposable scratch area
//!     stages/<stage>/   archived runs
//! ```
//!
//! Every path a component touches is obtained through [`ProjectPaths`], which
//! is bound to one project and refuses callers from any other project.

use crate::context::{ProjectId, RunId};
use crate::error::{EngineError, EngineResult};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Content hash in `sha256:<hex>` form
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// A single path segment supplied from outside (run id, stage, proposal id)
pub fn validate_segment(segment: &str) -> EngineResult<()> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains('\0');
    if bad {
        return Err(EngineError::InvalidId(format!("'{}' is not a valid path segment", segment)));
    }
    Ok(())
}

/// Write a file through a temp file in the same directory and an atomic rename.
/// Readers see either the previous content or the new one.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| EngineError::NotFound(format!("parent of {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write a file only if nothing exists at `path` yet.
/// Returns `false` when the slot was already occupied.
pub(crate) fn write_new(path: &Path, bytes: &[u8]) -> EngineResult<bool> {
    let dir = path
        .parent()
        .ok_or_else(|| EngineError::NotFound(format!("parent of {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error.into()),
    }
}

/// Serialize to pretty JSON with a trailing newline
pub(crate) fn to_json_bytes<T: serde::Serialize + ?Sized>(value: &T) -> EngineResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

// =============================================================================
// Workspace
// =============================================================================

/// Root directory holding the config file and all projects
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    /// Paths bound to a single project
    pub fn project(&self, id: &ProjectId) -> ProjectPaths {
        ProjectPaths {
            project: id.clone(),
            root: self.projects_dir().join(id.as_str()),
        }
    }

    pub fn list_projects(&self) -> EngineResult<Vec<ProjectId>> {
        let dir = self.projects_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = ProjectId::new(name) {
                    out.push(id);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

// =============================================================================
// Project paths
// =============================================================================

/// Filesystem namespace of one project
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    project: ProjectId,
    root: PathBuf,
}

impl ProjectPaths {
    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject any caller that is not the owning project
    pub fn guard(&self, caller: &ProjectId) -> EngineResult<()> {
        if caller != &self.project {
            tracing::error!(caller = %caller, target = %self.project, "cross-project access refused");
            return Err(EngineError::IsolationViolation {
                caller: caller.to_string(),
                target: self.project.to_string(),
            });
        }
        Ok(())
    }

    /// Resolve a project-relative path; only plain components are accepted
    pub fn join(&self, rel: &str) -> EngineResult<PathBuf> {
        let rel_path = Path::new(rel);
        let plain = !rel.is_empty() && rel_path.components().all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(EngineError::IsolationViolation {
                caller: self.project.to_string(),
                target: rel.to_string(),
            });
        }
        Ok(self.root.join(rel_path))
    }

    /// Project-relative form of an absolute path inside this project
    pub fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn brief_path(&self) -> PathBuf {
        self.root.join("brief.md")
    }

    pub fn canon_dir(&self) -> PathBuf {
        self.root.join("canon")
    }

    pub fn materials_dir(&self) -> PathBuf {
        self.root.join("materials")
    }

    pub fn units_dir(&self) -> PathBuf {
        self.root.join("units")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn changes_dir(&self) -> PathBuf {
        self.root.join("changes")
    }

    pub fn change_dir(&self, proposal_id: &str) -> EngineResult<PathBuf> {
        validate_segment(proposal_id)?;
        Ok(self.changes_dir().join(proposal_id))
    }

    pub fn gates_dir(&self) -> PathBuf {
        self.root.join("gates")
    }

    pub fn continuations_dir(&self) -> PathBuf {
        self.root.join("state").join("continuations")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, run: &RunId) -> PathBuf {
        self.runs_dir().join(run.as_str())
    }

    pub fn session_dir(&self, run: &RunId) -> PathBuf {
        self.root.join("session").join(run.as_str())
    }

    pub fn stages_dir(&self) -> PathBuf {
        self.root.join("stages")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("run.lock")
    }

    /// Create the fixed directory skeleton
    pub fn ensure_layout(&self) -> EngineResult<()> {
        let materials = self.materials_dir();
        for dir in [
            self.canon_dir(),
            materials.join("drafts"),
            materials.join("frozen"),
            materials.join("reviews"),
            materials.join("digests"),
            materials.join("anchors"),
            self.units_dir(),
            self.memory_dir(),
            self.changes_dir(),
            self.gates_dir(),
            self.continuations_dir(),
            self.runs_dir(),
            self.stages_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Runs recorded for this project, ordered by run sequence
    pub fn list_runs(&self) -> EngineResult<Vec<RunId>> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs: Vec<RunId> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().and_then(RunId::parse))
            .collect();
        runs.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    /// Find a run by its full directory name
    pub fn find_run(&self, name: &str) -> EngineResult<RunId> {
        validate_segment(name)?;
        self.list_runs()?
            .into_iter()
            .find(|r| r.as_str() == name)
            .ok_or_else(|| EngineError::NotFound(format!("run {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_guard_rejects_other_projects() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path());
        let alpha = ProjectId::new("alpha").unwrap();
        let beta = ProjectId::new("beta").unwrap();
        let paths = ws.project(&alpha);
        assert!(paths.guard(&alpha).is_ok());
        assert!(matches!(
            paths.guard(&beta),
            Err(EngineError::IsolationViolation { .. })
        ));
    }

    #[test]
    fn test_join_refuses_escape() {
        let temp = TempDir::new().unwrap();
        let paths = Workspace::new(temp.path()).project(&ProjectId::new("alpha").unwrap());
        assert!(paths.join("materials/index.json").is_ok());
        assert!(paths.join("../beta/materials/index.json").is_err());
        assert!(paths.join("/etc/passwd").is_err());
        assert!(paths.join("").is_err());
    }

    #[test]
    fn test_write_new_does_not_clobber() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("slot.json");
        assert!(write_new(&path, b"one").unwrap());
        assert!(!write_new(&path, b"two").unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"one");
    }

    #[test]
    fn test_list_runs_ordered_by_seq() {
        let temp = TempDir::new().unwrap();
        let paths = Workspace::new(temp.path()).project(&ProjectId::new("alpha").unwrap());
        let second = RunId::new(2);
        let first = RunId::new(1);
        std::fs::create_dir_all(paths.run_dir(&second)).unwrap();
        std::fs::create_dir_all(paths.run_dir(&first)).unwrap();
        std::fs::create_dir_all(paths.runs_dir().join("scratch")).unwrap();
        let runs = paths.list_runs().unwrap();
        assert_eq!(runs, vec![first, second]);
    }

    #[test]
    fn test_checksum_format() {
        let sum = checksum(b"hello");
        assert!(sum.starts_with("sha256:"));
        assert_eq!(sum.len(), "sha256:".len() + 64);
    }
}
