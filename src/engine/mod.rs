//! Workflow engine
//!
//! One [`Engine`] is one run over one project. It holds the project lock,
//! rebuilds cycle state from the audit log, quarantines whatever an
//! interrupted run left uncommitted, and then drives the materials, unit and
//! change-proposal cycles until each one completes or waits on a human gate.
//!
//! Every transition follows the same shape:
//!
//! 1. `node_start` is logged
//! 2. the work writes new slots and advances pointers
//! 3. `node_end` is logged with the snapshot and everything it committed
//!
//! A crash anywhere before step 3 leaves the cycle at its previous state and
//! the written slots uncommitted.

pub mod capability;
pub mod fsm;
mod materials;
mod recovery;
pub mod replay;
mod unit;

pub use capability::{Capability, CapabilityError, CapabilityOutput, CapabilityRequest, Role};
pub use fsm::{Machine, MaterialsMachine, ProposalMachine, UnitMachine};
pub use replay::{CycleSnapshot, CycleTable};

use crate::audit::{all_events, AuditLog, Event, EventDraft, EventType};
use crate::context::{ProjectId, RunContext, RunId};
use crate::error::{EngineError, EngineResult, ErrorCategory};
use crate::gate::{DecisionSource, GateController, GateKind, GateRecord, GateRequest};
use crate::models::unit::unit_id;
use crate::models::{EngineConfig, RawDecision};
use crate::services::{archive, session};
use crate::state::{ContinuationStore, ProjectLock, RunMeta, RunStatus};
use crate::store::layout::{atomic_write, to_json_bytes};
use crate::store::{AnchorIndex, ArtifactRef, ArtifactStore, Family, PointerRef, ProjectPaths, Workspace};
use capability::backoff_with_jitter;
use chrono::Utc;
use fsm::name_of;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Where a cycle stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    AwaitingDecision { gate_id: String },
    Suspended { proposal_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub frozen_version: Option<u32>,
    pub chapters_completed: Vec<u32>,
    /// `None` when every planned cycle completed
    pub stopped: Option<CycleOutcome>,
}

/// Written to `runs/<run>/halt.json` when a run stops on an error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltReport {
    pub run_id: String,
    pub project: String,
    pub cycle: String,
    pub state: Option<Value>,
    pub category: ErrorCategory,
    pub message: String,
    pub recoverable: bool,
    pub last_seq: u64,
    #[serde(default)]
    pub anchors: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub halted_at: String,
}

/// What a transition committed
#[derive(Debug, Default)]
pub(crate) struct Work {
    pub artifacts: Vec<ArtifactRef>,
    pub pointers: Vec<PointerRef>,
    pub fields: Map<String, Value>,
}

impl Work {
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

pub struct Engine {
    pub(crate) workspace: Workspace,
    pub(crate) paths: ProjectPaths,
    pub(crate) ctx: RunContext,
    pub(crate) store: ArtifactStore,
    pub(crate) anchors: AnchorIndex,
    pub(crate) log: AuditLog,
    pub(crate) gates: GateController,
    pub(crate) continuations: ContinuationStore,
    pub(crate) cycles: CycleTable,
    pub(crate) capability: Box<dyn Capability>,
    pub(crate) decisions: Box<dyn DecisionSource>,
    /// Decision handed in through the API for one gate
    pub(crate) injected: Option<(String, RawDecision)>,
    lock: Option<ProjectLock>,
    meta: RunMeta,
    last_beat: Instant,
    /// Slots created and pointers moved by the transition in progress
    in_flight: Vec<(Family, u32)>,
    touched: Vec<Family>,
}

impl Engine {
    /// Start a new run: lock the project, replay history and recover
    pub fn start(
        workspace: &Workspace,
        project: ProjectId,
        config: EngineConfig,
        capability: Box<dyn Capability>,
        decisions: Box<dyn DecisionSource>,
    ) -> EngineResult<Self> {
        let paths = workspace.project(&project);
        paths.ensure_layout()?;
        let previous = paths.list_runs()?.last().cloned();
        let run_id = RunId::new(previous.as_ref().map_or(1, |r| r.seq + 1));
        let lock = ProjectLock::acquire(
            &paths,
            &project,
            &run_id,
            Duration::from_secs(config.run.stale_after_secs),
        )?;

        let history = all_events(&paths, &project)?;
        let cycles = CycleTable::replay(&history)?;
        let log = AuditLog::open(paths.clone(), run_id.clone(), &config.run.stage, config.audit.inline_limit)?;

        let now = Utc::now();
        let meta = RunMeta {
            run_id: run_id.to_string(),
            project: project.to_string(),
            stage: config.run.stage.clone(),
            pid: std::process::id(),
            started_at: now,
            heartbeat_at: now,
            status: RunStatus::Running,
            previous_run: previous.as_ref().map(|r| r.to_string()),
        };
        meta.save(&paths, &project, &run_id)?;

        let mut engine = Self {
            workspace: workspace.clone(),
            store: ArtifactStore::open(paths.clone()),
            anchors: AnchorIndex::load(paths.clone())?,
            gates: GateController::new(paths.clone()),
            continuations: ContinuationStore::new(paths.clone()),
            ctx: RunContext::new(project, run_id, config),
            paths,
            log,
            cycles,
            capability,
            decisions,
            injected: None,
            lock: Some(lock),
            meta,
            last_beat: Instant::now(),
            in_flight: Vec::new(),
            touched: Vec::new(),
        };

        let started = match &previous {
            Some(prev) => EventDraft::new(EventType::RunResumed)
                .field("previous_run", prev.to_string())
                .field("replayed_events", history.len() as u64),
            None => EventDraft::new(EventType::RunStarted),
        };
        engine.emit(started.field("pid", std::process::id()))?;

        engine.recover()?;
        engine.ctx.frozen_version = engine.store.frozen_version(&engine.ctx.project)?;
        if let Some(version) = engine.ctx.frozen_version {
            engine.snapshot_session(version)?;
        }
        tracing::info!(
            project = %engine.ctx.project,
            run = %engine.ctx.run_id,
            frozen = ?engine.ctx.frozen_version,
            "run started"
        );
        Ok(engine)
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn run_id(&self) -> &RunId {
        &self.ctx.run_id
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn anchors(&self) -> &AnchorIndex {
        &self.anchors
    }

    pub fn gates(&self) -> &GateController {
        &self.gates
    }

    pub fn continuations(&self) -> &ContinuationStore {
        &self.continuations
    }

    /// Replayed state of a cycle
    pub fn cycle(&self, id: &str) -> Option<&CycleSnapshot> {
        self.cycles.cycle(id)
    }

    pub(crate) fn caller(&self) -> ProjectId {
        self.ctx.project.clone()
    }

    pub(crate) fn snapshot<M: Machine>(&self, cycle: &str, chapter: u32) -> EngineResult<CycleSnapshot> {
        match self.cycles.cycle(cycle) {
            Some(snap) => Ok(snap.clone()),
            None => CycleSnapshot::initial::<M>(cycle, chapter),
        }
    }

    // =========================================================================
    // Run loop
    // =========================================================================

    /// Drive materials, open proposals and the configured chapters until
    /// everything is done or a cycle waits on a human
    pub fn run(&mut self) -> EngineResult<RunSummary> {
        let mut summary = RunSummary {
            run_id: self.ctx.run_id.to_string(),
            frozen_version: None,
            chapters_completed: Vec::new(),
            stopped: None,
        };

        let outcome = self.run_materials()?;
        if outcome != CycleOutcome::Completed {
            return Ok(self.stop(summary, outcome));
        }
        if let Some(outcome) = self.proposals().drive_open()? {
            return Ok(self.stop(summary, outcome));
        }
        for chapter in 1..=self.ctx.config.run.chapters {
            match self.run_unit(chapter)? {
                CycleOutcome::Completed => summary.chapters_completed.push(chapter),
                outcome => return Ok(self.stop(summary, outcome)),
            }
        }
        summary.frozen_version = self.ctx.frozen_version;
        self.meta.status = RunStatus::Completed;
        Ok(summary)
    }

    fn stop(&mut self, mut summary: RunSummary, outcome: CycleOutcome) -> RunSummary {
        self.meta.status = match outcome {
            CycleOutcome::Suspended { .. } => RunStatus::Suspended,
            _ => RunStatus::AwaitingDecision,
        };
        summary.frozen_version = self.ctx.frozen_version;
        summary.stopped = Some(outcome);
        summary
    }

    /// Close the run: log its end, archive when configured, release the lock
    pub fn finish(mut self) -> EngineResult<()> {
        let status = self.meta.status;
        self.emit(EventDraft::new(EventType::RunCompleted).field_json("status", &status))?;
        if self.ctx.config.run.auto_archive {
            let run = self.ctx.run_id.clone();
            self.archive(&run, true)?;
        }
        self.meta.heartbeat_at = Utc::now();
        self.meta.save(&self.paths, &self.ctx.project, &self.ctx.run_id)?;
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        tracing::info!(run = %self.ctx.run_id, ?status, "run finished");
        Ok(())
    }

    /// Copy a run's log and session into `stages/<stage>/`
    pub fn archive(&mut self, run: &RunId, consent: bool) -> EngineResult<PathBuf> {
        if !consent {
            return Err(EngineError::ConsentRequired(format!("archive {}", run)));
        }
        let stage = self.ctx.config.run.stage.clone();
        self.emit(
            EventDraft::new(EventType::ArchiveStarted)
                .field("archived_run", run.to_string())
                .field("stage", stage.as_str()),
        )?;
        let outcome = archive::archive_run(&self.paths, &self.ctx.project, run, &stage, consent)?;
        self.emit(
            EventDraft::new(EventType::ArchiveCompleted)
                .field("archived_run", run.to_string())
                .field("stage", stage.as_str())
                .field("path", self.paths.relative(&outcome.path).unwrap_or_default())
                .field("files", outcome.files as u64),
        )?;
        Ok(outcome.path)
    }

    // =========================================================================
    // Events and transitions
    // =========================================================================

    /// Append an event and fold it into the replay table
    pub(crate) fn emit(&mut self, draft: EventDraft) -> EngineResult<Event> {
        self.keep_alive(false)?;
        let event = self.log.append(&self.ctx.project, draft)?;
        self.cycles.observe(&event)?;
        Ok(event)
    }

    fn heartbeat(&mut self) -> EngineResult<()> {
        if let Some(lock) = self.lock.as_mut() {
            lock.heartbeat()?;
        }
        self.last_beat = Instant::now();
        self.meta.heartbeat_at = Utc::now();
        self.meta.save(&self.paths, &self.ctx.project, &self.ctx.run_id)
    }

    fn beat_interval(&self) -> Duration {
        Duration::from_secs(self.ctx.config.run.stale_after_secs) / 4
    }

    /// Heartbeat when forced or when a quarter of the stale window has passed
    fn keep_alive(&mut self, force: bool) -> EngineResult<()> {
        if force || self.last_beat.elapsed() >= self.beat_interval() {
            self.heartbeat()?;
        }
        Ok(())
    }

    /// Sleep without letting the lock go stale
    fn pause(&mut self, total: Duration) -> EngineResult<()> {
        let slice = self.beat_interval().max(Duration::from_millis(100));
        let mut left = total;
        while !left.is_zero() {
            self.keep_alive(false)?;
            let step = left.min(slice);
            std::thread::sleep(step);
            left -= step;
        }
        self.keep_alive(false)
    }

    /// Run one guarded transition of machine `M` on `snap`
    pub(crate) fn transition<M: Machine>(
        &mut self,
        snap: &CycleSnapshot,
        action: M::Action,
        work: impl FnOnce(&mut Self, &mut CycleSnapshot) -> EngineResult<Work>,
    ) -> EngineResult<CycleSnapshot> {
        let from = snap.state::<M>()?;
        let to = fsm::step::<M>(from, action)?;
        let (from_name, action_name, to_name) = (name_of(&from), name_of(&action), name_of(&to));
        let node = format!("{}.{}", M::NAME, action_name);

        self.emit(
            EventDraft::new(EventType::NodeStart)
                .phase(M::NAME)
                .chapter(snap.chapter)
                .node(node.as_str())
                .field("machine", M::NAME)
                .field("cycle", snap.cycle.as_str())
                .field("from", from_name.as_str())
                .field("action", action_name.as_str())
                .field("to", to_name.as_str()),
        )?;
        tracing::debug!(cycle = %snap.cycle, from = %from_name, action = %action_name, "transition started");

        self.in_flight.clear();
        self.touched.clear();
        let mut next = snap.clone();
        let done = match work(self, &mut next) {
            Ok(done) => done,
            Err(err) => {
                if let Err(cleanup) = self.abort_transition(&node, snap, &err) {
                    tracing::error!(error = %cleanup, "failed to roll back transition");
                }
                return Err(err);
            }
        };
        next.set_state::<M>(to)?;

        let mut end = EventDraft::new(EventType::NodeEnd)
            .phase(M::NAME)
            .chapter(snap.chapter)
            .node(node.as_str())
            .field("machine", M::NAME)
            .field("cycle", snap.cycle.as_str())
            .field("from", from_name.as_str())
            .field("action", action_name.as_str())
            .field("to", to_name.as_str())
            .field_json("snapshot", &next)
            .field_json("artifacts", &done.artifacts)
            .field_json("pointers", &done.pointers);
        for (key, value) in done.fields {
            end = end.field(&key, value);
        }
        self.emit(end)?;
        self.in_flight.clear();
        self.touched.clear();
        self.heartbeat()?;
        tracing::info!(cycle = %snap.cycle, from = %from_name, to = %to_name, "transition committed");
        Ok(next)
    }

    fn abort_transition(&mut self, node: &str, snap: &CycleSnapshot, err: &EngineError) -> EngineResult<()> {
        let caller = self.caller();
        let tag = self.ctx.run_id.to_string();
        for (family, version) in std::mem::take(&mut self.in_flight) {
            let to = self.store.quarantine(&caller, family, version, &tag)?;
            self.emit(
                EventDraft::new(EventType::ArtifactQuarantined)
                    .chapter(snap.chapter)
                    .field("family", family.key())
                    .field("version", version)
                    .field("moved_to", self.paths.relative(&to).unwrap_or_default()),
            )?;
        }
        let touched = std::mem::take(&mut self.touched);
        self.restore_pointers(touched)?;
        self.rollback_anchors()?;
        self.emit(
            EventDraft::new(EventType::NodeFailed)
                .phase(snap.machine.as_str())
                .chapter(snap.chapter)
                .node(node)
                .field("cycle", snap.cycle.as_str())
                .field("category", err.category().name())
                .field("error", err.to_string()),
        )?;
        tracing::warn!(cycle = %snap.cycle, node, error = %err, "transition failed");
        Ok(())
    }

    // =========================================================================
    // Artifact helpers
    // =========================================================================

    fn track(&mut self, work: &mut Work, family: Family, version: u32, outcome: crate::store::WriteOutcome) -> EngineResult<ArtifactRef> {
        if outcome.created {
            self.in_flight.push((family, version));
        }
        let artifact = outcome.artifact;
        self.emit(
            EventDraft::new(EventType::ArtifactWritten)
                .chapter(family_chapter(family))
                .field("family", artifact.family.as_str())
                .field("version", version)
                .field("path", artifact.path.as_str())
                .field("hash", artifact.hash.as_str())
                .field("created", outcome.created),
        )?;
        work.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    pub(crate) fn put_json(&mut self, work: &mut Work, family: Family, version: u32, value: &Value) -> EngineResult<ArtifactRef> {
        let outcome = self.store.write_json(&self.ctx.project, family, version, value)?;
        self.track(work, family, version, outcome)
    }

    pub(crate) fn put_text(&mut self, work: &mut Work, family: Family, version: u32, text: &str) -> EngineResult<ArtifactRef> {
        let outcome = self.store.write(&self.ctx.project, family, version, text.as_bytes())?;
        self.track(work, family, version, outcome)
    }

    pub(crate) fn advance(&mut self, work: &mut Work, family: Family, version: u32) -> EngineResult<()> {
        self.touched.push(family);
        let pointer = self.store.advance_pointer(&self.ctx.project, family, version)?;
        self.emit(
            EventDraft::new(EventType::PointerAdvanced)
                .chapter(family_chapter(family))
                .field("family", pointer.family.as_str())
                .field("version", version),
        )?;
        work.pointers.push(pointer);
        Ok(())
    }

    /// Record slots written outside the helpers (freeze) as part of `work`
    pub(crate) fn adopt(&mut self, work: &mut Work, artifacts: Vec<ArtifactRef>, pointer: PointerRef) -> EngineResult<()> {
        if let Some(family) = Family::parse_key(&pointer.family) {
            self.touched.push(family);
        }
        for artifact in artifacts {
            if let Some(family) = Family::parse_key(&artifact.family) {
                if !self.cycles.is_committed(&artifact.path) {
                    self.in_flight.push((family, artifact.version));
                }
            }
            self.emit(
                EventDraft::new(EventType::ArtifactWritten)
                    .field("family", artifact.family.as_str())
                    .field("version", artifact.version)
                    .field("path", artifact.path.as_str())
                    .field("hash", artifact.hash.as_str()),
            )?;
            work.artifacts.push(artifact);
        }
        self.emit(
            EventDraft::new(EventType::PointerAdvanced)
                .field("family", pointer.family.as_str())
                .field("version", pointer.version),
        )?;
        work.pointers.push(pointer);
        Ok(())
    }

    pub(crate) fn frozen_pack(&self) -> EngineResult<(u32, Value)> {
        let version = self.ctx.require_frozen()?;
        Ok((version, self.store.read_json(&self.ctx.project, Family::MaterialsFrozen, version)?))
    }

    pub(crate) fn snapshot_session(&mut self, version: u32) -> EngineResult<()> {
        let dir = session::snapshot_materials(&self.store, &self.ctx.project, &self.ctx.run_id, version)?;
        tracing::debug!(dir = %dir.display(), version, "session snapshot refreshed");
        Ok(())
    }

    // =========================================================================
    // Gates
    // =========================================================================

    /// Open a gate for `snap`; a gate that is already open or decided is left alone
    pub(crate) fn open_gate(
        &mut self,
        kind: GateKind,
        gate_id: &str,
        snap: &CycleSnapshot,
        subject: String,
        summary: String,
        references: Vec<String>,
    ) -> EngineResult<()> {
        let request = GateRequest {
            gate_id: gate_id.to_string(),
            kind,
            cycle: snap.cycle.clone(),
            chapter: snap.chapter,
            round: snap.round,
            subject,
            summary,
            references,
            vocabulary: kind.vocabulary().iter().map(|s| s.to_string()).collect(),
            opened_at: Utc::now().to_rfc3339(),
            run_id: self.ctx.run_id.to_string(),
        };
        let caller = self.caller();
        self.gates.open_gate(&caller, &mut self.log, request)
    }

    /// Recorded, injected or sourced decision for an open gate
    pub(crate) fn next_decision(&mut self, gate_id: &str) -> EngineResult<Option<RawDecision>> {
        let caller = self.caller();
        if self.gates.record(&caller, gate_id)?.is_none() {
            if let Some((id, _)) = &self.injected {
                if id == gate_id {
                    return Ok(self.injected.take().map(|(_, raw)| raw));
                }
            }
        }
        self.gates.poll(&caller, self.decisions.as_mut(), gate_id)
    }

    /// Log a refused decision (when the gate is still open) and hand back the error
    pub(crate) fn refuse(&mut self, gate_id: &str, raw: &RawDecision, err: EngineError) -> EngineError {
        let caller = self.caller();
        let request = match self.gates.get(&caller, gate_id) {
            Ok(Some(request)) => request,
            _ => return err,
        };
        if let Err(e) = self
            .gates
            .refuse(&caller, &mut self.log, self.decisions.as_mut(), &request, raw, &err)
        {
            tracing::error!(error = %e, "failed to log refused decision");
        }
        err
    }

    pub(crate) fn record_gate(&mut self, gate_id: &str, action: &str, raw: &RawDecision) -> EngineResult<GateRecord> {
        let caller = self.caller();
        self.gates
            .record_decision(&caller, &mut self.log, self.decisions.as_mut(), gate_id, action, raw)
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    /// Invoke a capability with retry, logging every attempt, and accept the
    /// first output that passes `guard`
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn call<T>(
        &mut self,
        role: Role,
        task: &str,
        chapter: u32,
        round: u32,
        instructions: String,
        context: Value,
        guard: impl Fn(&Value) -> Result<T, String>,
    ) -> EngineResult<T> {
        let policy = self.ctx.config.capability.clone();
        let max_attempts = policy.max_attempts.max(1);
        let phase = role_phase(role);
        let node = format!("{}.{}", role, task);
        let context_text = serde_json::to_string_pretty(&context)?;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let request = CapabilityRequest {
                role,
                task: task.to_string(),
                project: self.ctx.project.to_string(),
                run_id: self.ctx.run_id.to_string(),
                chapter,
                round,
                attempt,
                instructions: instructions.clone(),
                context: context.clone(),
                timeout_secs: policy.timeout_secs,
            };
            self.emit(
                EventDraft::new(EventType::LlmRequest)
                    .phase(phase)
                    .chapter(chapter)
                    .node(node.as_str())
                    .field("role", role.as_str())
                    .field("task", task)
                    .field("round", round)
                    .field("attempt", attempt)
                    .payload("instructions", instructions.clone())
                    .payload("context", context_text.clone()),
            )?;

            self.keep_alive(true)?;
            let started = Instant::now();
            let failure = match self.capability.generate(&request) {
                Ok(output) => match guard(&output.content) {
                    Ok(value) => {
                        if output.truncated {
                            tracing::warn!(%role, task, attempt, "capability output was truncated");
                        }
                        self.emit(
                            EventDraft::new(EventType::LlmResponse)
                                .phase(phase)
                                .chapter(chapter)
                                .node(node.as_str())
                                .field("role", role.as_str())
                                .field("task", task)
                                .field("attempt", attempt)
                                .field("elapsed_ms", started.elapsed().as_millis() as u64)
                                .field("model", output.model.clone().unwrap_or_default())
                                .field("truncated", output.truncated)
                                .payload("content", serde_json::to_string_pretty(&output.content)?),
                        )?;
                        return Ok(value);
                    }
                    Err(reason) => CapabilityError::Malformed(reason),
                },
                Err(e) => e,
            };

            last_error = failure.to_string();
            self.emit(
                EventDraft::new(EventType::LlmError)
                    .phase(phase)
                    .chapter(chapter)
                    .node(node.as_str())
                    .field("role", role.as_str())
                    .field("task", task)
                    .field("attempt", attempt)
                    .field("kind", failure.kind())
                    .field("retryable", failure.is_retryable())
                    .field("error", last_error.as_str()),
            )?;
            tracing::warn!(%role, task, attempt, error = %failure, "capability call failed");

            if !failure.is_retryable() {
                return Err(EngineError::CapabilityFailure {
                    role: role.to_string(),
                    attempts: attempt,
                    message: last_error,
                });
            }
            if attempt < max_attempts {
                self.pause(backoff_with_jitter(&policy, attempt))?;
            }
        }

        Err(EngineError::CapabilityFailure {
            role: role.to_string(),
            attempts: max_attempts,
            message: last_error,
        })
    }

    // =========================================================================
    // Halting
    // =========================================================================

    /// Halt the run on errors a human has to look at; gate blocks and bad
    /// input are reported to the caller without halting
    pub(crate) fn guarded<T>(&mut self, cycle: &str, result: EngineResult<T>) -> EngineResult<T> {
        if let Err(err) = &result {
            let halting = !matches!(err.category(), ErrorCategory::BlockedGate | ErrorCategory::InvalidInput);
            // a nested cycle may already have halted the run
            if halting && self.meta.status != RunStatus::Halted {
                if let Err(e) = self.halt(cycle, err) {
                    tracing::error!(error = %e, "failed to write halt report");
                }
            }
        }
        result
    }

    fn halt(&mut self, cycle: &str, err: &EngineError) -> EngineResult<HaltReport> {
        if err.category() == ErrorCategory::IsolationViolation {
            self.emit(
                EventDraft::new(EventType::IsolationViolation)
                    .field("cycle", cycle)
                    .field("error", err.to_string()),
            )?;
        }
        let (anchors, evidence) = self.halt_refs(cycle);
        let report = HaltReport {
            run_id: self.ctx.run_id.to_string(),
            project: self.ctx.project.to_string(),
            cycle: cycle.to_string(),
            state: self.cycles.cycle(cycle).map(|s| s.state.clone()),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            last_seq: self.log.last_seq(),
            anchors,
            evidence,
            halted_at: Utc::now().to_rfc3339(),
        };
        let path = self.log.run_dir().join("halt.json");
        atomic_write(&path, &to_json_bytes(&report)?)?;
        self.emit(
            EventDraft::new(EventType::RunHalted)
                .field("cycle", cycle)
                .field("category", report.category.name())
                .field("recoverable", report.recoverable)
                .field("error", report.message.as_str())
                .field_json("anchors", &report.anchors)
                .field_json("evidence", &report.evidence),
        )?;
        self.meta.status = RunStatus::Halted;
        self.meta.save(&self.paths, &self.ctx.project, &self.ctx.run_id)?;
        tracing::error!(cycle, category = report.category.name(), error = %err, "run halted");
        Ok(report)
    }

    /// Anchors and evidence that help diagnose a halted cycle
    fn halt_refs(&self, cycle: &str) -> (Vec<String>, Vec<String>) {
        let caller = &self.ctx.project;
        if let Some(chapter) = crate::models::unit::parse_unit_id(cycle) {
            let anchors = self
                .store
                .pointer(caller, Family::UnitReview(chapter))
                .ok()
                .flatten()
                .and_then(|v| self.store.read_json(caller, Family::UnitReview(chapter), v).ok())
                .and_then(|v| crate::models::ReviewReport::from_output(&v).ok())
                .map(|r| {
                    let mut ids: Vec<String> = r.issues.into_iter().flat_map(|i| i.anchors).collect();
                    ids.sort();
                    ids.dedup();
                    ids
                })
                .unwrap_or_default();
            return (anchors, vec![unit_id(chapter)]);
        }
        if cycle.starts_with("CP-") {
            let record = self
                .paths
                .change_dir(cycle)
                .ok()
                .and_then(|dir| std::fs::read(dir.join("proposal.json")).ok())
                .and_then(|bytes| serde_json::from_slice::<crate::models::ProposalRecord>(&bytes).ok());
            if let Some(record) = record {
                let evidence: Vec<String> = record.evidence.iter().map(|e| e.to_string()).collect();
                let anchors = record
                    .evidence
                    .iter()
                    .filter(|e| matches!(e, crate::models::Evidence::Anchor(_)))
                    .map(|e| e.to_string())
                    .collect();
                return (anchors, evidence);
            }
        }
        (Vec::new(), Vec::new())
    }
}

fn role_phase(role: Role) -> &'static str {
    match role {
        Role::MaterialsAuthor | Role::MaterialsReviewer => "materials",
        Role::Writer | Role::Editor => "unit",
        Role::Advisor => "proposal",
    }
}

fn family_chapter(family: Family) -> u32 {
    match family {
        Family::UnitText(c) | Family::UnitReview(c) | Family::UnitDecision(c) => c,
        _ => 0,
    }
}
