use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Closed set of audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Spans
    SpanStart,
    SpanEnd,
    PhaseStart,
    PhaseEnd,
    NodeStart,
    NodeEnd,
    NodeFailed,
    // Capability calls
    LlmRequest,
    LlmResponse,
    LlmError,
    // Gates
    GateOpen,
    GateDecision,
    GateBlocked,
    // Materials findings
    ConflictDetected,
    OpenQuestion,
    ChecklistResult,
    GlossaryDrift,
    // Proposal lifecycle
    ProposalSubmitted,
    ProposalReviewed,
    ProposalApproved,
    ProposalRejected,
    MigrationStep,
    MigrationCompleted,
    MigrationHalted,
    // Unit cycle
    UnitSuspended,
    UnitResumed,
    MemoryDeposited,
    // Store
    ArtifactWritten,
    ArtifactQuarantined,
    PointerAdvanced,
    FreezeCompleted,
    RefreezeCompleted,
    // Archive
    ArchiveStarted,
    ArchiveCompleted,
    // Run lifecycle
    RunStarted,
    RunResumed,
    RunHalted,
    RunCompleted,
    IsolationViolation,
}

impl EventType {
    pub const ALL: [EventType; 39] = [
        EventType::SpanStart,
        EventType::SpanEnd,
        EventType::PhaseStart,
        EventType::PhaseEnd,
        EventType::NodeStart,
        EventType::NodeEnd,
        EventType::NodeFailed,
        EventType::LlmRequest,
        EventType::LlmResponse,
        EventType::LlmError,
        EventType::GateOpen,
        EventType::GateDecision,
        EventType::GateBlocked,
        EventType::ConflictDetected,
        EventType::OpenQuestion,
        EventType::ChecklistResult,
        EventType::GlossaryDrift,
        EventType::ProposalSubmitted,
        EventType::ProposalReviewed,
        EventType::ProposalApproved,
        EventType::ProposalRejected,
        EventType::MigrationStep,
        EventType::MigrationCompleted,
        EventType::MigrationHalted,
        EventType::UnitSuspended,
        EventType::UnitResumed,
        EventType::MemoryDeposited,
        EventType::ArtifactWritten,
        EventType::ArtifactQuarantined,
        EventType::PointerAdvanced,
        EventType::FreezeCompleted,
        EventType::RefreezeCompleted,
        EventType::ArchiveStarted,
        EventType::ArchiveCompleted,
        EventType::RunStarted,
        EventType::RunResumed,
        EventType::RunHalted,
        EventType::RunCompleted,
        EventType::IsolationViolation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SpanStart => "span_start",
            EventType::SpanEnd => "span_end",
            EventType::PhaseStart => "phase_start",
            EventType::PhaseEnd => "phase_end",
            EventType::NodeStart => "node_start",
            EventType::NodeEnd => "node_end",
            EventType::NodeFailed => "node_failed",
            EventType::LlmRequest => "llm_request",
            EventType::LlmResponse => "llm_response",
            EventType::LlmError => "llm_error",
            EventType::GateOpen => "gate_open",
            EventType::GateDecision => "gate_decision",
            EventType::GateBlocked => "gate_blocked",
            EventType::ConflictDetected => "conflict_detected",
            EventType::OpenQuestion => "open_question",
            EventType::ChecklistResult => "checklist_result",
            EventType::GlossaryDrift => "glossary_drift",
            EventType::ProposalSubmitted => "proposal_submitted",
            EventType::ProposalReviewed => "proposal_reviewed",
            EventType::ProposalApproved => "proposal_approved",
            EventType::ProposalRejected => "proposal_rejected",
            EventType::MigrationStep => "migration_step",
            EventType::MigrationCompleted => "migration_completed",
            EventType::MigrationHalted => "migration_halted",
            EventType::UnitSuspended => "unit_suspended",
            EventType::UnitResumed => "unit_resumed",
            EventType::MemoryDeposited => "memory_deposited",
            EventType::ArtifactWritten => "artifact_written",
            EventType::ArtifactQuarantined => "artifact_quarantined",
            EventType::PointerAdvanced => "pointer_advanced",
            EventType::FreezeCompleted => "freeze_completed",
            EventType::RefreezeCompleted => "refreeze_completed",
            EventType::ArchiveStarted => "archive_started",
            EventType::ArchiveCompleted => "archive_completed",
            EventType::RunStarted => "run_started",
            EventType::RunResumed => "run_resumed",
            EventType::RunHalted => "run_halted",
            EventType::RunCompleted => "run_completed",
            EventType::IsolationViolation => "isolation_violation",
        }
    }

    /// Strict parse; free-form strings are rejected
    pub fn parse(s: &str) -> EngineResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::UnknownEventType(s.to_string()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer to an externalized payload, relative to the run directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayloadRef {
    pub path: String,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// One record of the full stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub run_id: String,
    pub project: String,
    pub seq: u64,
    pub ts: String,
    pub stage: String,
    pub phase: String,
    /// Chapter number, 0 for materials and project-level work
    pub chapter: u32,
    pub node: String,
    pub event_type: EventType,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub payloads: BTreeMap<String, PayloadRef>,
}

impl Event {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }
}

/// Event under construction; identity fields are assigned by the log
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub phase: String,
    pub chapter: u32,
    pub node: String,
    pub fields: Map<String, Value>,
    pub payloads: Vec<(String, String)>,
    /// First field that failed to serialize; appending such a draft fails
    pub invalid: Option<String>,
}

impl EventDraft {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            phase: String::new(),
            chapter: 0,
            node: String::new(),
            fields: Map::new(),
            payloads: Vec::new(),
            invalid: None,
        }
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    pub fn chapter(mut self, chapter: u32) -> Self {
        self.chapter = chapter;
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Serialize any value into a field. A value that does not serialize
    /// marks the draft invalid and [`AuditLog::append`] refuses it.
    ///
    /// [`AuditLog::append`]: crate::audit::AuditLog::append
    pub fn field_json<T: Serialize>(mut self, key: &str, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.fields.insert(key.to_string(), value);
            }
            Err(e) => {
                tracing::warn!(event = self.event_type.as_str(), field = key, error = %e, "event field does not serialize");
                if self.invalid.is_none() {
                    self.invalid = Some(format!("field '{}' of {}: {}", key, self.event_type.as_str(), e));
                }
            }
        }
        self
    }

    /// Large text that is always externalized
    pub fn payload(mut self, name: &str, content: impl Into<String>) -> Self {
        self.payloads.push((name.to_string(), content.into()));
        self
    }
}

// =============================================================================
// Index stream
// =============================================================================

const SUMMARY_VALUE_MAX: usize = 80;
const SUMMARY_MAX: usize = 240;

/// Short-field record of the index stream, derived from an [`Event`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexRecord {
    pub seq: u64,
    pub event_id: String,
    pub run_id: String,
    pub project: String,
    pub ts: String,
    pub event_type: EventType,
    pub stage: String,
    pub phase: String,
    pub chapter: u32,
    pub node: String,
    /// `key=value` pairs of short scalar fields, in key order
    pub summary: String,
    pub payload_count: usize,
}

impl IndexRecord {
    /// Deterministic derivation; the index is a cache of the full stream
    pub fn derive(event: &Event) -> Self {
        let mut keys: Vec<&String> = event.fields.keys().collect();
        keys.sort();
        let mut parts = Vec::new();
        for key in keys {
            let rendered = match &event.fields[key] {
                Value::String(s) if s.chars().count() <= SUMMARY_VALUE_MAX => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            parts.push(format!("{}={}", key, rendered));
        }
        let mut summary = parts.join(" ");
        if summary.chars().count() > SUMMARY_MAX {
            summary = summary.chars().take(SUMMARY_MAX).collect();
        }
        Self {
            seq: event.seq,
            event_id: event.event_id.clone(),
            run_id: event.run_id.clone(),
            project: event.project.clone(),
            ts: event.ts.clone(),
            event_type: event.event_type,
            stage: event.stage.clone(),
            phase: event.phase.clone(),
            chapter: event.chapter,
            node: event.node.clone(),
            summary,
            payload_count: event.payloads.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_are_unique_and_parse() {
        let mut seen = std::collections::HashSet::new();
        for t in EventType::ALL {
            assert!(seen.insert(t.as_str()));
            assert_eq!(EventType::parse(t.as_str()).unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        assert!(matches!(
            EventType::parse("gate_opened"),
            Err(EngineError::UnknownEventType(_))
        ));
        let bad = r#"{"event_id":"e","run_id":"r","project":"p","seq":1,"ts":"t","stage":"s","phase":"","chapter":0,"node":"","event_type":"free_form"}"#;
        assert!(serde_json::from_str::<Event>(bad).is_err());
    }

    #[test]
    fn test_index_summary_keeps_short_scalars_only() {
        let event = Event {
            event_id: "e1".to_string(),
            run_id: "run-0001-abcd1234".to_string(),
            project: "alpha".to_string(),
            seq: 4,
            ts: "2026-01-01T00:00:00Z".to_string(),
            stage: "stage1".to_string(),
            phase: "unit".to_string(),
            chapter: 2,
            node: "writer".to_string(),
            event_type: EventType::NodeEnd,
            fields: serde_json::json!({
                "to": "agent_review",
                "round": 1,
                "nested": {"a": 1},
                "long": "x".repeat(200)
            })
            .as_object()
            .cloned()
            .unwrap(),
            payloads: BTreeMap::new(),
        };
        let record = IndexRecord::derive(&event);
        assert_eq!(record.summary, "round=1 to=agent_review");
        assert_eq!(record, IndexRecord::derive(&event));
    }
}
