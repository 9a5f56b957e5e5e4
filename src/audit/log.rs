//! Dual-stream, append-only run log
//!
//! `events.jsonl` is the source of truth. `events.index.jsonl` holds one
//! [`IndexRecord`] per event and can always be regenerated from the full
//! stream. Sequence numbers start at 1 and are gap-free per run.

use super::event::{Event, EventDraft, IndexRecord};
use super::payload::{store_payload, verify_payload};
use crate::context::{ProjectId, RunId};
use crate::error::{EngineError, EngineResult};
use crate::store::layout::{atomic_write, ProjectPaths};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const EVENTS_FILE: &str = "events.jsonl";
pub const INDEX_FILE: &str = "events.index.jsonl";

/// Appender for one run's log
#[derive(Debug)]
pub struct AuditLog {
    paths: ProjectPaths,
    run: RunId,
    stage: String,
    inline_limit: usize,
    next_seq: u64,
}

impl AuditLog {
    /// Open (or continue) the log of `run`, repairing a torn final line and a
    /// lagging index.
    pub fn open(paths: ProjectPaths, run: RunId, stage: &str, inline_limit: usize) -> EngineResult<Self> {
        let dir = paths.run_dir(&run);
        std::fs::create_dir_all(dir.join("payloads"))?;
        repair_torn_tail(&dir.join(EVENTS_FILE))?;

        let events = read_events_in(&dir)?;
        let index_len = read_index_in(&dir).map(|r| r.len()).unwrap_or(usize::MAX);
        if index_len != events.len() {
            tracing::warn!(run = %run, events = events.len(), "index stream out of step, rebuilding");
            write_index(&dir, &events)?;
        }

        Ok(Self {
            next_seq: events.last().map_or(1, |e| e.seq + 1),
            paths,
            run,
            stage: stage.to_string(),
            inline_limit,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run
    }

    pub fn run_dir(&self) -> PathBuf {
        self.paths.run_dir(&self.run)
    }

    /// Sequence number of the last durable event, 0 when empty
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Append one event to both streams. Long string fields and explicit
    /// payloads are moved to the payload area first.
    pub fn append(&mut self, caller: &ProjectId, draft: EventDraft) -> EngineResult<Event> {
        self.paths.guard(caller)?;
        if let Some(reason) = draft.invalid {
            return Err(EngineError::Json(<serde_json::Error as serde::ser::Error>::custom(reason)));
        }
        let dir = self.run_dir();

        let mut fields = draft.fields;
        let mut payloads = std::collections::BTreeMap::new();
        for (name, content) in &draft.payloads {
            payloads.insert(name.clone(), store_payload(&dir, content)?);
        }
        let long_keys: Vec<String> = fields
            .iter()
            .filter(|(_, v)| v.as_str().is_some_and(|s| s.chars().count() > self.inline_limit))
            .map(|(k, _)| k.clone())
            .collect();
        for key in long_keys {
            if let Some(Value::String(content)) = fields.remove(&key) {
                payloads.insert(key, store_payload(&dir, &content)?);
            }
        }

        let event = Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            run_id: self.run.to_string(),
            project: self.paths.project().to_string(),
            seq: self.next_seq,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            stage: self.stage.clone(),
            phase: draft.phase,
            chapter: draft.chapter,
            node: draft.node,
            event_type: draft.event_type,
            fields,
            payloads,
        };

        append_line(&dir.join(EVENTS_FILE), &serde_json::to_string(&event)?)?;
        append_line(&dir.join(INDEX_FILE), &serde_json::to_string(&IndexRecord::derive(&event))?)?;
        self.next_seq += 1;
        tracing::trace!(seq = event.seq, event_type = %event.event_type, "event appended");
        Ok(event)
    }
}

fn append_line(path: &Path, line: &str) -> EngineResult<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_data()?;
    Ok(())
}

/// Cut a final line that was never terminated by a newline
fn repair_torn_tail(path: &Path) -> EngineResult<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(false);
    }
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    tracing::warn!(path = %path.display(), dropped = bytes.len() - keep, "dropped torn final log line");
    Ok(true)
}

// =============================================================================
// Replay
// =============================================================================

fn read_events_in(dir: &Path) -> EngineResult<Vec<Event>> {
    let path = dir.join(EVENTS_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    let torn = !content.is_empty() && !content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let mut events = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) if torn && i + 1 == lines.len() => {
                tracing::warn!(path = %path.display(), "ignoring torn final line");
                break;
            }
            Err(e) => {
                return Err(EngineError::LogCorruption(format!(
                    "{} line {}: {}",
                    path.display(),
                    i + 1,
                    e
                )))
            }
        };
        let expected = events.last().map_or(1, |prev: &Event| prev.seq + 1);
        if event.seq != expected {
            return Err(EngineError::LogCorruption(format!(
                "{}: sequence gap, expected {} found {}",
                path.display(),
                expected,
                event.seq
            )));
        }
        events.push(event);
    }
    Ok(events)
}

fn read_index_in(dir: &Path) -> EngineResult<Vec<IndexRecord>> {
    let path = dir.join(INDEX_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(EngineError::from))
        .collect()
}

fn write_index(dir: &Path, events: &[Event]) -> EngineResult<()> {
    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(&IndexRecord::derive(event))?);
        out.push('\n');
    }
    atomic_write(&dir.join(INDEX_FILE), out.as_bytes())
}

/// Full stream of one run, verified gap-free
pub fn read_events(paths: &ProjectPaths, caller: &ProjectId, run: &RunId) -> EngineResult<Vec<Event>> {
    paths.guard(caller)?;
    read_events_in(&paths.run_dir(run))
}

pub fn read_index(paths: &ProjectPaths, caller: &ProjectId, run: &RunId) -> EngineResult<Vec<IndexRecord>> {
    paths.guard(caller)?;
    read_index_in(&paths.run_dir(run))
}

/// Events of every run of the project, ordered by (run seq, event seq)
pub fn all_events(paths: &ProjectPaths, caller: &ProjectId) -> EngineResult<Vec<(RunId, Event)>> {
    paths.guard(caller)?;
    let mut out = Vec::new();
    for run in paths.list_runs()? {
        for event in read_events_in(&paths.run_dir(&run))? {
            out.push((run.clone(), event));
        }
    }
    Ok(out)
}

/// Regenerate the index stream from the full stream
pub fn rebuild_index(paths: &ProjectPaths, caller: &ProjectId, run: &RunId) -> EngineResult<usize> {
    paths.guard(caller)?;
    let dir = paths.run_dir(run);
    let events = read_events_in(&dir)?;
    write_index(&dir, &events)?;
    tracing::info!(run = %run, events = events.len(), "index rebuilt");
    Ok(events.len())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VerifyReport {
    pub run_id: String,
    pub events: usize,
    pub last_seq: u64,
    /// Sequence numbers whose index record differs from the derived one
    pub index_mismatches: Vec<u64>,
    pub index_len: usize,
    /// Payload paths that are missing or fail their hash
    pub bad_payloads: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.index_mismatches.is_empty() && self.index_len == self.events && self.bad_payloads.is_empty()
    }
}

/// Check sequence continuity, index consistency and payload integrity
pub fn verify_run(paths: &ProjectPaths, caller: &ProjectId, run: &RunId) -> EngineResult<VerifyReport> {
    paths.guard(caller)?;
    let dir = paths.run_dir(run);
    let events = read_events_in(&dir)?;
    let index = read_index_in(&dir)?;

    let index_mismatches = events
        .iter()
        .enumerate()
        .filter(|(i, e)| index.get(*i) != Some(&IndexRecord::derive(e)))
        .map(|(_, e)| e.seq)
        .collect();

    let mut bad_payloads = Vec::new();
    for event in &events {
        for payload in event.payloads.values() {
            if !verify_payload(&dir, payload)? {
                bad_payloads.push(payload.path.clone());
            }
        }
    }

    Ok(VerifyReport {
        run_id: run.to_string(),
        events: events.len(),
        last_seq: events.last().map_or(0, |e| e.seq),
        index_mismatches,
        index_len: index.len(),
        bad_payloads,
    })
}
