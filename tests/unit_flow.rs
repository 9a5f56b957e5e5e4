mod common;

use common::{needs_changes, Fixture};
use inkgate::audit::EventType;
use inkgate::engine::HaltReport;
use inkgate::models::{HumanReviewRecord, MemoryRecord, RawDecision, UnitDecision};
use inkgate::store::{checksum, Family};
use inkgate::{CycleOutcome, EngineError, ErrorCategory};

fn frozen_fixture() -> Fixture {
    let fx = Fixture::new();
    fx.frozen().finish().unwrap();
    fx
}

fn awaiting(gate: &str) -> Option<CycleOutcome> {
    Some(CycleOutcome::AwaitingDecision {
        gate_id: gate.to_string(),
    })
}

#[test]
fn test_unit_waits_for_a_human_before_anything_is_deposited() {
    let fx = frozen_fixture();
    let mut engine = fx.start();

    let summary = engine.run().unwrap();
    assert_eq!(summary.stopped, awaiting("unit-001-g01"));
    assert!(summary.chapters_completed.is_empty());
    assert_eq!(fx.store().latest_version(&fx.project, Family::Memory).unwrap(), None);
    assert_eq!(fx.count(EventType::MemoryDeposited), 0);

    let write = fx.script.requests().into_iter().find(|r| r.task == "write_unit").unwrap();
    assert_eq!(write.chapter, 1);
    assert_eq!(write.context["materials"]["meta"]["version"], 1);
}

#[test]
fn test_accept_deposits_memory() {
    let fx = frozen_fixture();
    fx.decisions
        .push("unit-001-g01", RawDecision::new("accept").with_rationale("good"));
    let mut engine = fx.start();

    let summary = engine.run().unwrap();
    assert_eq!(summary.stopped, None);
    assert_eq!(summary.chapters_completed, vec![1]);

    let store = fx.store();
    let memory: MemoryRecord = serde_json::from_value(store.read_json(&fx.project, Family::Memory, 1).unwrap()).unwrap();
    assert_eq!(memory.chapter, 1);
    assert_eq!(memory.round, 1);
    assert_eq!(memory.frozen_version, 1);
    assert_eq!(memory.text_hash, checksum("The tide came in.".as_bytes()));
    assert_eq!(fx.count(EventType::MemoryDeposited), 1);

    let decision: HumanReviewRecord =
        serde_json::from_value(store.read_json(&fx.project, Family::UnitDecision(1), 1).unwrap()).unwrap();
    assert_eq!(decision.decision, UnitDecision::Accept);
    assert_eq!(decision.rationale, "good");
    assert_eq!(decision.gate_id, "unit-001-g01");
    engine.finish().unwrap();
}

#[test]
fn test_request_rewrite_produces_next_round() {
    let fx = frozen_fixture();
    fx.decisions.push(
        "unit-001-g01",
        RawDecision::new("request_rewrite").with_instructions(&["slow the opening"]),
    );
    let mut engine = fx.start();

    let summary = engine.run().unwrap();
    assert_eq!(summary.stopped, awaiting("unit-001-g02"));
    let store = fx.store();
    assert_eq!(
        store.read_text(&fx.project, Family::UnitText(1), 2).unwrap(),
        "The tide came in, slower."
    );
    assert_eq!(store.pointer(&fx.project, Family::UnitText(1)).unwrap(), Some(2));
    assert_eq!(store.pointer(&fx.project, Family::UnitReview(1)).unwrap(), Some(2));

    let rewrite = fx.script.requests().into_iter().find(|r| r.task == "rewrite_unit").unwrap();
    assert!(rewrite.instructions.contains("slow the opening"));
    assert_eq!(fx.count(EventType::MemoryDeposited), 0);
}

#[test]
fn test_rewrite_budget_exhaustion_halts() {
    let fx = frozen_fixture();
    for gate in ["unit-001-g01", "unit-001-g02", "unit-001-g03"] {
        fx.decisions
            .push(gate, RawDecision::new("request_rewrite").with_instructions(&["again"]));
    }
    let mut engine = fx.start();

    let err = engine.run().unwrap_err();
    match &err {
        EngineError::RewriteBudgetExhausted { chapter, limit } => {
            assert_eq!(*chapter, 1);
            assert_eq!(*limit, 2);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(fx.script.calls("rewrite_unit"), 2);
    assert_eq!(fx.count(EventType::RunHalted), 1);

    let halt = engine.paths().run_dir(engine.run_id()).join("halt.json");
    let report: HaltReport = serde_json::from_slice(&std::fs::read(halt).unwrap()).unwrap();
    assert_eq!(report.category, ErrorCategory::Budget);
    assert_eq!(report.cycle, "unit-001");
    assert_eq!(report.evidence, vec!["unit-001".to_string()]);

    let pending = engine.gates().pending(&fx.project).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].gate_id, "unit-001-g03");
}

#[test]
fn test_waive_checks_issue_ids_and_skips_deposit() {
    let fx = frozen_fixture();
    fx.script.set_default("review_unit", needs_changes(&["ED-1"]));
    fx.decisions.push(
        "unit-001-g01",
        RawDecision::new("waive").with_issues(&["ED-9"]).with_rationale("not an issue"),
    );
    let mut engine = fx.start();

    let err = engine.run().unwrap_err();
    assert!(matches!(err, EngineError::InvalidDecision { .. }));
    assert_eq!(fx.count(EventType::GateBlocked), 1);
    assert_eq!(fx.count(EventType::RunHalted), 0);

    let pending = engine.gates().pending(&fx.project).unwrap();
    assert_eq!(pending[0].gate_id, "unit-001-g01");
    assert!(pending[0].references.contains(&"ED-1".to_string()));
    assert!(pending[0].references.contains(&"WR-001".to_string()));

    fx.decisions.push(
        "unit-001-g01",
        RawDecision::new("waive").with_issues(&["ED-1"]).with_rationale("intended ambiguity"),
    );
    let summary = engine.run().unwrap();
    assert_eq!(summary.chapters_completed, vec![1]);
    assert_eq!(fx.count(EventType::MemoryDeposited), 0);
    assert_eq!(fx.store().latest_version(&fx.project, Family::Memory).unwrap(), None);

    let decision: HumanReviewRecord = serde_json::from_value(
        fx.store()
            .read_json(&fx.project, Family::UnitDecision(1), 1)
            .unwrap(),
    )
    .unwrap();
    match decision.decision {
        UnitDecision::Waive { issues } => {
            assert_eq!(issues.len(), 1);
            assert_eq!(issues[0].issue_id, "ED-1");
            assert_eq!(issues[0].reason, "intended ambiguity");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_units_need_frozen_materials() {
    let fx = Fixture::new();
    let mut engine = fx.start();
    let summary = engine.run().unwrap();
    assert_eq!(summary.stopped, awaiting("materials-g01"));
    assert_eq!(fx.script.calls("write_unit"), 0);
}
