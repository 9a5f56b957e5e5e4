//! Shared fixtures: a scripted capability, a scripted decision source and
//! materials packs.

#![allow(dead_code)]

use inkgate::audit::{all_events, Event, EventType};
use inkgate::engine::{Capability, CapabilityError, CapabilityOutput, CapabilityRequest, Engine};
use inkgate::gate::{DecisionSource, GateRequest};
use inkgate::models::{EngineConfig, RawDecision};
use inkgate::store::{ArtifactStore, ProjectPaths, Workspace};
use inkgate::{EngineResult, ProjectId};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tempfile::TempDir;

// =============================================================================
// Scripted capability
// =============================================================================

#[derive(Default)]
struct ScriptState {
    queued: HashMap<String, VecDeque<Result<CapabilityOutput, CapabilityError>>>,
    defaults: HashMap<String, Value>,
    requests: Vec<CapabilityRequest>,
}

/// Capability answering by task name: queued responses first, then the default
#[derive(Clone, Default)]
pub struct Script {
    state: Rc<RefCell<ScriptState>>,
}

impl Script {
    /// Defaults that take every cycle through without findings
    pub fn standard() -> Self {
        let script = Self::default();
        script.set_default("draft_materials", pack());
        script.set_default("revise_materials", pack());
        script.set_default("review_materials", pass_review());
        script.set_default("write_unit", unit_text("The tide came in."));
        script.set_default("rewrite_unit", unit_text("The tide came in, slower."));
        script.set_default("review_unit", pass_review());
        script.set_default("draft_proposal", proposal_draft());
        script.set_default("review_proposal", advisor("approve"));
        script
    }

    pub fn set_default(&self, task: &str, content: Value) {
        self.state.borrow_mut().defaults.insert(task.to_string(), content);
    }

    pub fn push(&self, task: &str, content: Value) {
        self.push_result(task, Ok(CapabilityOutput::new(content)));
    }

    pub fn push_error(&self, task: &str, error: CapabilityError) {
        self.push_result(task, Err(error));
    }

    pub fn push_result(&self, task: &str, result: Result<CapabilityOutput, CapabilityError>) {
        self.state
            .borrow_mut()
            .queued
            .entry(task.to_string())
            .or_default()
            .push_back(result);
    }

    /// Number of calls made for `task`
    pub fn calls(&self, task: &str) -> usize {
        self.state.borrow().requests.iter().filter(|r| r.task == task).count()
    }

    pub fn requests(&self) -> Vec<CapabilityRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn boxed(&self) -> Box<dyn Capability> {
        Box::new(self.clone())
    }
}

impl Capability for Script {
    fn generate(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
        let mut state = self.state.borrow_mut();
        state.requests.push(request.clone());
        if let Some(result) = state.queued.get_mut(&request.task).and_then(|q| q.pop_front()) {
            return result;
        }
        match state.defaults.get(&request.task) {
            Some(content) => Ok(CapabilityOutput::new(content.clone())),
            None => Err(CapabilityError::Fatal(format!("no script for task {}", request.task))),
        }
    }
}

// =============================================================================
// Scripted decisions
// =============================================================================

#[derive(Default)]
struct DecisionState {
    queued: Vec<(String, VecDeque<RawDecision>)>,
    consumed: Vec<String>,
}

/// Decision source keyed by gate id suffix (`materials-g01`, `-approval`)
#[derive(Clone, Default)]
pub struct Decisions {
    state: Rc<RefCell<DecisionState>>,
}

impl Decisions {
    pub fn push(&self, gate_suffix: &str, raw: RawDecision) {
        let mut state = self.state.borrow_mut();
        match state.queued.iter_mut().find(|(k, _)| k == gate_suffix) {
            Some((_, queue)) => queue.push_back(raw),
            None => state.queued.push((gate_suffix.to_string(), VecDeque::from([raw]))),
        }
    }

    /// Gates whose decisions were consumed, in order
    pub fn consumed(&self) -> Vec<String> {
        self.state.borrow().consumed.clone()
    }

    pub fn boxed(&self) -> Box<dyn DecisionSource> {
        Box::new(self.clone())
    }
}

impl DecisionSource for Decisions {
    fn poll(&mut self, gate: &GateRequest) -> EngineResult<Option<RawDecision>> {
        let state = self.state.borrow();
        Ok(state
            .queued
            .iter()
            .find(|(k, q)| gate.gate_id.ends_with(k.as_str()) && !q.is_empty())
            .and_then(|(_, q)| q.front().cloned()))
    }

    fn consumed(&mut self, gate_id: &str) -> EngineResult<()> {
        let mut state = self.state.borrow_mut();
        if let Some((_, queue)) = state
            .queued
            .iter_mut()
            .find(|(k, q)| gate_id.ends_with(k.as_str()) && !q.is_empty())
        {
            queue.pop_front();
        }
        state.consumed.push(gate_id.to_string());
        Ok(())
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub struct Fixture {
    pub temp: TempDir,
    pub workspace: Workspace,
    pub project: ProjectId,
    pub script: Script,
    pub decisions: Decisions,
    pub config: EngineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let workspace = Workspace::new(temp.path());
        let project = ProjectId::new("alpha").unwrap();
        workspace.project(&project).ensure_layout().unwrap();
        std::fs::write(workspace.project(&project).brief_path(), "A lighthouse keeper and the sea.").unwrap();
        Self {
            temp,
            workspace,
            project,
            script: Script::standard(),
            decisions: Decisions::default(),
            config: config(),
        }
    }

    pub fn start(&self) -> Engine {
        Engine::start(
            &self.workspace,
            self.project.clone(),
            self.config.clone(),
            self.script.boxed(),
            self.decisions.boxed(),
        )
        .unwrap()
    }

    pub fn paths(&self) -> ProjectPaths {
        self.workspace.project(&self.project)
    }

    pub fn store(&self) -> ArtifactStore {
        ArtifactStore::open(self.paths())
    }

    /// Events of every run so far
    pub fn events(&self) -> Vec<Event> {
        all_events(&self.paths(), &self.project)
            .unwrap()
            .into_iter()
            .map(|(_, e)| e)
            .collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events().iter().filter(|e| e.event_type == event_type).count()
    }

    /// Start a run with a one-off config
    pub fn start_with(&self, config: EngineConfig) -> Engine {
        Engine::start(
            &self.workspace,
            self.project.clone(),
            config,
            self.script.boxed(),
            self.decisions.boxed(),
        )
        .unwrap()
    }

    /// Run materials through to a frozen v1 without starting any unit
    pub fn frozen(&self) -> Engine {
        self.decisions
            .push("materials-g01", RawDecision::new("freeze").with_rationale("ready"));
        let mut config = self.config.clone();
        config.run.chapters = 0;
        let mut engine = self.start_with(config);
        let summary = engine.run().unwrap();
        assert_eq!(summary.frozen_version, Some(1));
        engine
    }
}

pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.capability.base_backoff_ms = 0;
    config.capability.max_backoff_ms = 0;
    config.run.chapters = 1;
    config
}

// =============================================================================
// Content
// =============================================================================

/// Pack that passes every freeze predicate
pub fn pack() -> Value {
    json!({
        "meta": {"title": "The Keeper"},
        "canon": {
            "world": {"rules": [{"name": "The light never goes out"}, {"name": "No one swims past the reef"}]},
            "characters": {"characters": [{"name": "Ines", "role": "keeper"}]},
            "timeline": {"events": [{"name": "The wreck", "when": "year 0"}]}
        },
        "planning": {
            "outline": {"chapters": [{"n": 1, "beat": "arrival"}, {"n": 2, "beat": "storm"}]},
            "tone": "quiet, salt-worn"
        },
        "execution": {
            "decisions": [{"id": "D1", "text": "close third person"}],
            "checklists": {"style": {"items": ["no flashbacks"]}},
            "glossary": {"places": [{"term": "the Reef"}]},
            "constraints": {"pov": {"rule": "Ines only"}}
        },
        "risk": {
            "open_questions": [{"id": "Q1", "question": "Does Ines have a sister?", "severity": "minor", "default_assumption": "no"}],
            "conflicts": []
        }
    })
}

/// Pack with one unresolved blocker question
pub fn pack_with_blocker() -> Value {
    let mut p = pack();
    p["risk"]["open_questions"] = json!([
        {"id": "Q1", "question": "Is the keeper alive at the end?", "severity": "blocker"}
    ]);
    p
}

pub fn pass_review() -> Value {
    json!({"verdict": "pass", "summary": "reads clean", "issues": []})
}

pub fn needs_changes(ids: &[&str]) -> Value {
    let issues: Vec<Value> = ids
        .iter()
        .map(|id| json!({"id": id, "severity": "major", "kind": "continuity", "description": format!("problem {}", id), "anchors": ["WR-001"]}))
        .collect();
    json!({"verdict": "needs_changes", "summary": "needs work", "issues": issues})
}

pub fn unit_text(text: &str) -> Value {
    json!({"text": text, "summary": "Ines arrives at the light."})
}

pub fn proposal_draft() -> Value {
    json!({
        "what": "Allow swimming past the reef at low tide",
        "why": "Chapter 1 needs an escape route",
        "impact": "World rule WR-002 changes",
        "migration_plan": [
            {"id": "s1", "op": "set", "path": "canon.world.rules[1].name", "value": "Only at low tide may one swim past the reef"},
            {"id": "s2", "op": "append", "path": "execution.decisions", "value": {"id": "D2", "text": "low tide matters"}}
        ],
        "evidence": ["unit-001"]
    })
}

pub fn advisor(recommendation: &str) -> Value {
    json!({"recommendation": recommendation, "notes": "small and contained", "risks": []})
}
