mod common;

use common::Fixture;
use inkgate::audit::{call_graph_by_chapter, read_events, read_index, rebuild_index, verify_run, EventType, EVENTS_FILE, INDEX_FILE};
use inkgate::models::RawDecision;
use inkgate::{EngineError, RunId};
use std::collections::HashSet;
use std::io::Write;

/// Materials frozen and chapter 1 waiting at its gate, run closed
fn finished_run() -> (Fixture, RunId) {
    let fx = Fixture::new();
    fx.decisions.push("materials-g01", RawDecision::new("freeze"));
    let mut engine = fx.start();
    engine.run().unwrap();
    let run = engine.run_id().clone();
    engine.finish().unwrap();
    (fx, run)
}

#[test]
fn test_run_log_is_gap_free_and_verifies() {
    let (fx, run) = finished_run();
    let paths = fx.paths();
    let events = read_events(&paths, &fx.project, &run).unwrap();

    assert_eq!(events.first().map(|e| e.event_type), Some(EventType::RunStarted));
    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::RunCompleted));
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1);
        assert_eq!(event.run_id, run.to_string());
        assert_eq!(event.project, "alpha");
    }
    let ids: HashSet<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids.len(), events.len());

    let report = verify_run(&paths, &fx.project, &run).unwrap();
    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.last_seq, events.len() as u64);
    assert_eq!(read_index(&paths, &fx.project, &run).unwrap().len(), events.len());
}

#[test]
fn test_every_transition_is_bracketed() {
    let (fx, run) = finished_run();
    let events = read_events(&fx.paths(), &fx.project, &run).unwrap();

    let starts = events.iter().filter(|e| e.event_type == EventType::NodeStart).count();
    let ends = events.iter().filter(|e| e.event_type == EventType::NodeEnd).count();
    assert!(starts > 0);
    assert_eq!(starts, ends);

    let freeze_end = events
        .iter()
        .find(|e| e.event_type == EventType::NodeEnd && e.node == "materials.freeze")
        .unwrap();
    assert_eq!(freeze_end.u64_field("frozen_version"), Some(1));
    assert!(freeze_end.fields["artifacts"].as_array().is_some_and(|a| !a.is_empty()));
    assert!(freeze_end.fields["snapshot"].is_object());
}

#[test]
fn test_index_can_be_rebuilt() {
    let (fx, run) = finished_run();
    let paths = fx.paths();
    let index = paths.run_dir(&run).join(INDEX_FILE);

    std::fs::write(&index, "").unwrap();
    let report = verify_run(&paths, &fx.project, &run).unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.index_len, 0);

    let rebuilt = rebuild_index(&paths, &fx.project, &run).unwrap();
    assert_eq!(rebuilt, report.events);
    assert!(verify_run(&paths, &fx.project, &run).unwrap().is_clean());
}

#[test]
fn test_missing_payload_is_reported() {
    let (fx, run) = finished_run();
    let paths = fx.paths();
    let events = read_events(&paths, &fx.project, &run).unwrap();
    let request = events
        .iter()
        .find(|e| e.event_type == EventType::LlmRequest)
        .unwrap();
    let payload = request.payloads.get("context").unwrap();
    std::fs::remove_file(paths.run_dir(&run).join(&payload.path)).unwrap();

    let report = verify_run(&paths, &fx.project, &run).unwrap();
    assert!(report.bad_payloads.contains(&payload.path));
    assert!(!report.is_clean());
}

#[test]
fn test_sequence_gap_is_corruption() {
    let (fx, run) = finished_run();
    let paths = fx.paths();
    let file = paths.run_dir(&run).join(EVENTS_FILE);
    let content = std::fs::read_to_string(&file).unwrap();
    let kept: Vec<&str> = content.lines().enumerate().filter(|(i, _)| *i != 2).map(|(_, l)| l).collect();
    std::fs::write(&file, format!("{}\n", kept.join("\n"))).unwrap();

    let err = read_events(&paths, &fx.project, &run).unwrap_err();
    assert!(matches!(err, EngineError::LogCorruption(_)));
}

#[test]
fn test_torn_tail_is_ignored() {
    let (fx, run) = finished_run();
    let paths = fx.paths();
    let before = read_events(&paths, &fx.project, &run).unwrap().len();

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(paths.run_dir(&run).join(EVENTS_FILE))
        .unwrap();
    file.write_all(br#"{"event_id":"x","seq":"#).unwrap();
    drop(file);

    assert_eq!(read_events(&paths, &fx.project, &run).unwrap().len(), before);
}

#[test]
fn test_call_graph_groups_nodes_by_chapter() {
    let (fx, run) = finished_run();
    let events = read_events(&fx.paths(), &fx.project, &run).unwrap();
    let graph = call_graph_by_chapter(&events);

    assert!(graph.starts_with("flowchart TD\n"));
    assert!(graph.contains("subgraph c0[\"materials\"]"));
    assert!(graph.contains("subgraph c1[\"chapter 1\"]"));
    assert!(graph.contains("materials.produce"));
    assert!(graph.contains("unit.write"));
    assert!(graph.contains("c1_unit_write --> c1_unit_review"));
}

#[test]
fn test_each_run_has_its_own_stream() {
    let (fx, first) = finished_run();
    let engine = fx.start();
    let second = engine.run_id().clone();
    engine.finish().unwrap();

    assert_ne!(first, second);
    let events = read_events(&fx.paths(), &fx.project, &second).unwrap();
    assert_eq!(events[0].seq, 1);
    assert_eq!(events[0].event_type, EventType::RunResumed);
    assert_eq!(events[0].str_field("previous_run"), Some(first.as_str()));
}
