//! Single-writer project lock (`run.lock`) and run metadata
//!
//! A run holds the lock for its whole lifetime and refreshes the heartbeat
//! while it works. On the holder's own host the lock is taken over only once
//! its process is gone; from another host, only once the heartbeat is older
//! than the configured stale window. Every heartbeat first checks the lock is
//! still ours.

use crate::context::{ProjectId, RunId};
use crate::error::{EngineError, EngineResult};
use crate::store::layout::{atomic_write, to_json_bytes, ProjectPaths};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockInfo {
    pub run_id: String,
    pub pid: u32,
    #[serde(default)]
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LockInfo {
    fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let age = now.signed_duration_since(self.heartbeat_at);
        age.to_std().map_or(false, |age| age > stale_after)
    }

    /// Whether a new run may take this lock over
    fn is_abandoned(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if !self.host.is_empty() && self.host == current_host() {
            if let Some(alive) = process_alive(self.pid) {
                return !alive;
            }
        }
        self.is_stale(now, stale_after)
    }
}

fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> Option<bool> {
    let Ok(pid) = i32::try_from(pid) else {
        return Some(false);
    };
    if pid <= 0 {
        return Some(false);
    }
    // signal 0 only checks that the process exists
    let rc = unsafe { libc::kill(pid, 0) };
    Some(rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}

#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
    project: String,
    info: LockInfo,
    held: bool,
}

impl ProjectLock {
    /// Take the project lock for `run`, or fail with `ProjectBusy` while a
    /// live run holds it
    pub fn acquire(paths: &ProjectPaths, caller: &ProjectId, run: &RunId, stale_after: Duration) -> EngineResult<Self> {
        paths.guard(caller)?;
        let path = paths.lock_path();
        let now = Utc::now();
        let info = LockInfo {
            run_id: run.to_string(),
            pid: std::process::id(),
            host: current_host(),
            started_at: now,
            heartbeat_at: now,
        };
        let content = serde_yaml::to_string(&info)?;

        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(content.as_bytes())?;
                file.sync_all()?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match Self::holder_at(&path)? {
                    Some(holder) if !holder.is_abandoned(now, stale_after) => {
                        return Err(EngineError::ProjectBusy {
                            project: caller.to_string(),
                            run_id: holder.run_id,
                        });
                    }
                    holder => {
                        tracing::warn!(
                            previous = holder.as_ref().map_or("unreadable", |h| h.run_id.as_str()),
                            "taking over abandoned project lock"
                        );
                        atomic_write(&path, content.as_bytes())?;
                    }
                }
                // another taker may have raced us through the stale window
                if Self::holder_at(&path)?.map(|h| h.run_id) != Some(info.run_id.clone()) {
                    return Err(EngineError::ProjectBusy {
                        project: caller.to_string(),
                        run_id: "unknown".to_string(),
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(run = %run, "project lock acquired");
        Ok(Self {
            path,
            project: caller.to_string(),
            info,
            held: true,
        })
    }

    fn holder_at(path: &std::path::Path) -> EngineResult<Option<LockInfo>> {
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content).ok())
    }

    /// Current holder of a project's lock, if any
    pub fn holder(paths: &ProjectPaths) -> EngineResult<Option<LockInfo>> {
        Self::holder_at(&paths.lock_path())
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Refresh the heartbeat, or fail with `ProjectBusy` once another run has
    /// taken the lock over
    pub fn heartbeat(&mut self) -> EngineResult<()> {
        match Self::holder_at(&self.path)? {
            Some(holder) if holder.run_id == self.info.run_id => {}
            other => {
                self.held = false;
                let run_id = other.map_or_else(|| "none".to_string(), |h| h.run_id);
                tracing::error!(run = %self.info.run_id, holder = %run_id, "project lock lost");
                return Err(EngineError::ProjectBusy {
                    project: self.project.clone(),
                    run_id,
                });
            }
        }
        self.info.heartbeat_at = Utc::now();
        atomic_write(&self.path, serde_yaml::to_string(&self.info)?.as_bytes())
    }

    pub fn release(mut self) -> EngineResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> EngineResult<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        // only remove the file while it is still ours
        if Self::holder_at(&self.path)?.is_some_and(|h| h.run_id == self.info.run_id) {
            std::fs::remove_file(&self.path)?;
        }
        tracing::debug!(run = %self.info.run_id, "project lock released");
        Ok(())
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!(error = %e, "failed to release project lock");
        }
    }
}

// =============================================================================
// Run metadata
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingDecision,
    Suspended,
    Halted,
    Completed,
}

/// `runs/<run>/run_meta.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub project: String,
    pub stage: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default)]
    pub previous_run: Option<String>,
}

impl RunMeta {
    pub fn path(paths: &ProjectPaths, run: &RunId) -> PathBuf {
        paths.run_dir(run).join("run_meta.json")
    }

    pub fn save(&self, paths: &ProjectPaths, caller: &ProjectId, run: &RunId) -> EngineResult<()> {
        paths.guard(caller)?;
        atomic_write(&Self::path(paths, run), &to_json_bytes(self)?)
    }

    pub fn load(paths: &ProjectPaths, caller: &ProjectId, run: &RunId) -> EngineResult<Option<Self>> {
        paths.guard(caller)?;
        let path = Self::path(paths, run);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::layout::Workspace;
    use tempfile::TempDir;

    fn paths(temp: &TempDir) -> (ProjectPaths, ProjectId) {
        let id = ProjectId::new("alpha").unwrap();
        let paths = Workspace::new(temp.path()).project(&id);
        paths.ensure_layout().unwrap();
        (paths, id)
    }

    #[test]
    fn test_second_live_run_is_refused() {
        let temp = TempDir::new().unwrap();
        let (paths, id) = paths(&temp);
        let first = ProjectLock::acquire(&paths, &id, &RunId::new(1), Duration::from_secs(900)).unwrap();
        let err = ProjectLock::acquire(&paths, &id, &RunId::new(2), Duration::from_secs(900)).unwrap_err();
        match err {
            EngineError::ProjectBusy { run_id, .. } => assert_eq!(run_id, first.info().run_id),
            other => panic!("unexpected {:?}", other),
        }
        first.release().unwrap();
        assert!(ProjectLock::acquire(&paths, &id, &RunId::new(2), Duration::from_secs(900)).is_ok());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let temp = TempDir::new().unwrap();
        let (paths, id) = paths(&temp);
        let old = Utc::now() - chrono::Duration::hours(2);
        let dead = LockInfo {
            run_id: "run-0001-deadbeef".to_string(),
            pid: 1,
            host: "elsewhere".to_string(),
            started_at: old,
            heartbeat_at: old,
        };
        std::fs::write(paths.lock_path(), serde_yaml::to_string(&dead).unwrap()).unwrap();

        let lock = ProjectLock::acquire(&paths, &id, &RunId::new(2), Duration::from_secs(60)).unwrap();
        assert_eq!(ProjectLock::holder(&paths).unwrap().unwrap().run_id, lock.info().run_id);
        drop(lock);
        assert!(ProjectLock::holder(&paths).unwrap().is_none());
    }

    #[test]
    fn test_live_holder_on_this_host_is_never_taken_over() {
        let temp = TempDir::new().unwrap();
        let (paths, id) = paths(&temp);
        let stale_after = Duration::from_millis(1);
        let first = ProjectLock::acquire(&paths, &id, &RunId::new(1), stale_after).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // the heartbeat is stale but the holding process is alive
        let err = ProjectLock::acquire(&paths, &id, &RunId::new(2), stale_after).unwrap_err();
        assert!(matches!(err, EngineError::ProjectBusy { .. }));
        assert_eq!(ProjectLock::holder(&paths).unwrap().unwrap().run_id, first.info().run_id);
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_holder_on_this_host_is_taken_over_at_once() {
        let temp = TempDir::new().unwrap();
        let (paths, id) = paths(&temp);
        let now = Utc::now();
        let crashed = LockInfo {
            run_id: "run-0001-0badf00d".to_string(),
            pid: i32::MAX as u32,
            host: current_host(),
            started_at: now,
            heartbeat_at: now,
        };
        std::fs::write(paths.lock_path(), serde_yaml::to_string(&crashed).unwrap()).unwrap();

        let lock = ProjectLock::acquire(&paths, &id, &RunId::new(2), Duration::from_secs(900)).unwrap();
        assert_eq!(ProjectLock::holder(&paths).unwrap().unwrap().run_id, lock.info().run_id);
    }

    #[test]
    fn test_heartbeat_fails_after_takeover() {
        let temp = TempDir::new().unwrap();
        let (paths, id) = paths(&temp);
        let mut first = ProjectLock::acquire(&paths, &id, &RunId::new(1), Duration::from_secs(900)).unwrap();
        first.heartbeat().unwrap();

        // another host decided the heartbeat was stale and took over
        let old = Utc::now() - chrono::Duration::hours(1);
        let taker = LockInfo {
            run_id: "run-0002-feedface".to_string(),
            pid: 4242,
            host: "elsewhere".to_string(),
            started_at: old,
            heartbeat_at: Utc::now(),
        };
        std::fs::write(paths.lock_path(), serde_yaml::to_string(&taker).unwrap()).unwrap();

        match first.heartbeat().unwrap_err() {
            EngineError::ProjectBusy { project, run_id } => {
                assert_eq!(project, "alpha");
                assert_eq!(run_id, "run-0002-feedface");
            }
            other => panic!("unexpected {:?}", other),
        }
        // the new holder's lock is neither overwritten nor removed
        assert_eq!(ProjectLock::holder(&paths).unwrap().unwrap(), taker);
        drop(first);
        assert_eq!(ProjectLock::holder(&paths).unwrap().unwrap(), taker);
    }
}
