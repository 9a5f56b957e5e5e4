mod common;

use common::{needs_changes, pack, pack_with_blocker, Fixture};
use inkgate::audit::EventType;
use inkgate::engine::{CapabilityError, CapabilityOutput, HaltReport};
use inkgate::models::{AnchorId, RawDecision};
use inkgate::services::snapshot_version;
use inkgate::store::Family;
use inkgate::{CycleOutcome, EngineError, ErrorCategory};
use serde_json::json;

fn awaiting(gate: &str) -> Option<CycleOutcome> {
    Some(CycleOutcome::AwaitingDecision {
        gate_id: gate.to_string(),
    })
}

#[test]
fn test_materials_wait_at_gate_then_freeze() {
    let fx = Fixture::new();
    let mut engine = fx.start();

    let summary = engine.run().unwrap();
    assert_eq!(summary.stopped, awaiting("materials-g01"));
    assert_eq!(summary.frozen_version, None);
    assert_eq!(fx.script.calls("draft_materials"), 1);
    assert_eq!(fx.script.calls("review_materials"), 1);
    assert_eq!(fx.count(EventType::GateOpen), 1);

    fx.decisions
        .push("materials-g01", RawDecision::new("freeze").with_rationale("looks complete"));
    let summary = engine.run().unwrap();
    assert_eq!(summary.frozen_version, Some(1));
    assert_eq!(summary.stopped, awaiting("unit-001-g01"));

    let store = fx.store();
    assert!(store.exists(&fx.project, Family::MaterialsFrozen, 1).unwrap());
    assert!(store.exists(&fx.project, Family::MaterialsDigest, 1).unwrap());
    assert_eq!(store.frozen_version(&fx.project).unwrap(), Some(1));

    let frozen = store.read_json(&fx.project, Family::MaterialsFrozen, 1).unwrap();
    assert_eq!(frozen["meta"]["status"], json!("frozen"));
    assert_eq!(frozen["canon"]["world"]["rules"][0]["anchor"], json!("WR-001"));
    let wr1: AnchorId = "WR-001".parse().unwrap();
    assert!(engine.anchors().contains(&wr1));

    assert_eq!(snapshot_version(&store, engine.run_id()), Some(1));
    assert_eq!(fx.count(EventType::FreezeCompleted), 1);
    assert_eq!(fx.decisions.consumed(), vec!["materials-g01".to_string()]);
    engine.finish().unwrap();
}

#[test]
fn test_blocker_question_refuses_freeze_until_answered() {
    let fx = Fixture::new();
    fx.script.set_default("draft_materials", pack_with_blocker());
    fx.decisions.push("materials-g01", RawDecision::new("freeze"));
    let mut config = fx.config.clone();
    config.run.chapters = 0;
    let mut engine = fx.start_with(config);

    let err = engine.run().unwrap_err();
    match &err {
        EngineError::BlockedGate { gate, predicates } => {
            assert_eq!(gate, "materials-g01");
            assert!(predicates
                .iter()
                .any(|p| p.predicate.contains("blocker") && p.details.contains(&"Q1".to_string())));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(fx.count(EventType::GateBlocked), 1);
    assert_eq!(fx.count(EventType::RunHalted), 0);
    assert!(!engine.paths().run_dir(engine.run_id()).join("halt.json").exists());
    let pending = engine.gates().pending(&fx.project).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].gate_id, "materials-g01");
    assert_eq!(fx.store().frozen_version(&fx.project).unwrap(), None);

    fx.decisions.push(
        "materials-g01",
        RawDecision::new("answer_questions").with_answer("Q1", "yes, she lives"),
    );
    fx.decisions.push("materials-g02", RawDecision::new("freeze"));
    let summary = engine.run().unwrap();
    assert_eq!(summary.frozen_version, Some(2));
    assert_eq!(summary.stopped, None);

    let frozen = fx.store().read_json(&fx.project, Family::MaterialsFrozen, 2).unwrap();
    assert_eq!(frozen["risk"]["open_questions"][0]["resolved"], json!(true));
    assert_eq!(frozen["risk"]["open_questions"][0]["answer"], json!("yes, she lives"));
    assert!(!fx.store().exists(&fx.project, Family::MaterialsFrozen, 1).unwrap());
}

#[test]
fn test_agent_review_loop_is_capped() {
    let fx = Fixture::new();
    fx.script.set_default("review_materials", needs_changes(&["MR-1", "MR-2"]));
    let mut engine = fx.start();

    let summary = engine.run().unwrap();
    assert_eq!(summary.stopped, awaiting("materials-g01"));
    assert_eq!(fx.script.calls("review_materials"), 3);
    assert_eq!(fx.script.calls("revise_materials"), 2);
    assert_eq!(fx.store().pointer(&fx.project, Family::MaterialsDraft).unwrap(), Some(3));

    let revise = fx
        .script
        .requests()
        .into_iter()
        .find(|r| r.task == "revise_materials")
        .unwrap();
    assert!(revise.instructions.contains("MR-1"));
}

#[test]
fn test_unknown_action_is_rejected_without_halting() {
    let fx = Fixture::new();
    fx.decisions.push("materials-g01", RawDecision::new("approve"));
    let mut engine = fx.start();

    let err = engine.run().unwrap_err();
    assert!(matches!(err, EngineError::InvalidDecision { .. }));
    assert_eq!(err.category(), ErrorCategory::InvalidInput);
    assert_eq!(fx.count(EventType::GateBlocked), 1);
    assert_eq!(fx.count(EventType::RunHalted), 0);
    assert_eq!(engine.gates().pending(&fx.project).unwrap().len(), 1);

    // the refused decision was consumed, the gate waits again
    let summary = engine.run().unwrap();
    assert_eq!(summary.stopped, awaiting("materials-g01"));
}

#[test]
fn test_transient_failure_is_retried() {
    let fx = Fixture::new();
    fx.script
        .push_error("draft_materials", CapabilityError::Transient("busy".to_string()));
    let mut engine = fx.start();

    let summary = engine.run().unwrap();
    assert_eq!(summary.stopped, awaiting("materials-g01"));
    assert_eq!(fx.script.calls("draft_materials"), 2);

    let errors: Vec<_> = fx
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::LlmError)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].str_field("kind"), Some("transient"));
    assert_eq!(errors[0].fields.get("retryable"), Some(&json!(true)));
}

#[test]
fn test_fatal_failure_halts_the_run() {
    let fx = Fixture::new();
    fx.script
        .push_error("draft_materials", CapabilityError::Fatal("no credentials".to_string()));
    let mut engine = fx.start();

    let err = engine.run().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::CapabilityFailure);
    assert_eq!(fx.script.calls("draft_materials"), 1);
    assert_eq!(fx.count(EventType::NodeFailed), 1);
    assert_eq!(fx.count(EventType::RunHalted), 1);

    let halt = engine.paths().run_dir(engine.run_id()).join("halt.json");
    let report: HaltReport = serde_json::from_slice(&std::fs::read(halt).unwrap()).unwrap();
    assert_eq!(report.cycle, "materials");
    assert_eq!(report.category, ErrorCategory::CapabilityFailure);
    assert!(report.message.contains("no credentials"));
}

#[test]
fn test_malformed_output_exhausts_attempts_then_resumes() {
    let fx = Fixture::new();
    for _ in 0..3 {
        fx.script.push("draft_materials", json!({"canon": {}}));
    }
    let mut engine = fx.start();

    match engine.run().unwrap_err() {
        EngineError::CapabilityFailure { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(fx.count(EventType::LlmError), 3);
    assert!(fx.store().pointer(&fx.project, Family::MaterialsDraft).unwrap().is_none());
    drop(engine);

    let mut engine = fx.start();
    assert_eq!(fx.count(EventType::RunResumed), 1);
    let summary = engine.run().unwrap();
    assert_eq!(summary.stopped, awaiting("materials-g01"));
    assert_eq!(fx.script.calls("draft_materials"), 4);
}

#[test]
fn test_truncated_output_is_flagged_in_the_log() {
    let fx = Fixture::new();
    fx.script.push_result(
        "draft_materials",
        Ok(CapabilityOutput {
            content: pack(),
            truncated: true,
            model: Some("m-large".to_string()),
        }),
    );
    let mut engine = fx.start();
    engine.run().unwrap();

    let response = fx
        .events()
        .into_iter()
        .find(|e| e.event_type == EventType::LlmResponse && e.str_field("task") == Some("draft_materials"))
        .unwrap();
    assert_eq!(response.fields.get("truncated"), Some(&json!(true)));
    assert_eq!(response.str_field("model"), Some("m-large"));
}
