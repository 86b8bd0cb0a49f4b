//! End-to-end runs of the standard pipeline.
//!
//! These tests drive a full run from seed inputs to the final report and
//! check the graph, the ledger and the persisted run records.

use std::collections::BTreeMap;

use tempfile::TempDir;

use gatekeep::config::PipelineConfig;
use gatekeep::core::{StageKind, TaskKind, TaskStatus};
use gatekeep::coverage::{CoveragePolicy, HintLevel};
use gatekeep::dispute::Verdict;
use gatekeep::finding::{FindingStatus, Severity};
use gatekeep::orchestration::{RunDirectory, RunStatus, COVERAGE_ARTIFACT, LEDGER_ARTIFACT};

use crate::fixtures::{
    is_stage, nodes_where, scripted, seeds, test_config, ReviewFinding, Script,
};

/// Test: Standard run completes
/// Given a producer that answers every stage correctly
/// When the standard plan runs
/// Then every node completes and the run is complete
#[tokio::test]
async fn test_standard_run_completes() {
    let (orchestrator, _producer) = scripted(Script::default(), test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Complete);
    let graph = outcome.graph.read().await;
    // 13 planned nodes plus two arguments and a verdict for one dispute.
    assert_eq!(graph.len(), 16);
    assert_eq!(graph.counts().completed, 16);
    assert!(graph.is_acyclic());
    assert!(outcome.report.escalations.is_empty());
    assert!(outcome.report.blocked.is_empty());
}

/// Test: Duplicate findings merge and the HIGH one is confirmed and closed
/// Given both reviewers report the same overflow at different lines
/// When the run consolidates, disputes and verifies fixes
/// Then one finding carries both sources, its reproduction and a closure
#[tokio::test]
async fn test_confirmed_finding_is_closed_with_evidence() {
    let (orchestrator, _producer) = scripted(Script::default(), test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();
    let findings = &outcome.report.findings;
    assert_eq!(findings.len(), 2);

    let overflow = findings.iter().find(|f| f.id == "F-001").unwrap();
    assert_eq!(overflow.severity, Severity::High);
    assert_eq!(overflow.status, FindingStatus::Closed);
    assert_eq!(overflow.reproduction_ref.as_deref(), Some("repro/F-001"));
    assert_eq!(
        overflow.regression_test_ref.as_deref(),
        Some("tests/regression_F-001.rs")
    );
    assert!(overflow.verifier_confirmed);
    assert_eq!(overflow.sources.len(), 2);

    assert_eq!(outcome.report.disputes.len(), 1);
    assert_eq!(outcome.report.disputes[0].verdict, Some(Verdict::Confirmed));
}

/// Test: LOW findings are recorded without a dispute
/// Given a LOW finding from one reviewer
/// When the run consolidates
/// Then it is an open finding and no dispute node names it
#[tokio::test]
async fn test_low_finding_recorded_without_dispute() {
    let (orchestrator, _producer) = scripted(Script::default(), test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();

    let low = outcome
        .report
        .findings
        .iter()
        .find(|f| f.severity == Severity::Low)
        .unwrap();
    assert_eq!(low.status, FindingStatus::Open);
    assert!(low.reproduction_ref.is_none());
    assert!(outcome
        .report
        .disputes
        .iter()
        .all(|d| d.subject_finding_id != low.id));
}

/// Test: A run with only LOW findings has no dispute nodes
/// Given reviewers that only report LOW and INFO issues
/// When the run finishes
/// Then the graph holds exactly the planned nodes
#[tokio::test]
async fn test_low_only_run_opens_no_disputes() {
    let script = Script {
        opus_findings: vec![ReviewFinding::new("Unused import", "INFO", "src/lib.rs:1")],
        codex_findings: vec![ReviewFinding::new("Missing docs", "LOW", "src/vault.rs:3")],
        detection_candidates: 0,
        detection_validated: 0,
        ..Script::default()
    };
    let config = PipelineConfig {
        max_detection_passes: 1,
        ..test_config()
    };
    let (orchestrator, _producer) = scripted(script, config);
    let outcome = orchestrator.run(seeds()).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Complete);
    assert_eq!(outcome.graph.read().await.len(), 13);
    assert_eq!(outcome.report.findings.len(), 2);
    assert!(outcome.report.disputes.is_empty());
}

/// Test: Stalled detection climbs the hint ladder
/// Given detection passes that never add a validated HIGH/MED finding
/// When the run closes each pass
/// Then passes are inserted at low, medium and high hints and then stop
#[tokio::test]
async fn test_stalled_detection_escalates_hints() {
    let script = Script {
        detection_validated: 0,
        ..Script::default()
    };
    let (orchestrator, producer) = scripted(script, test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();

    let graph = outcome.graph.read().await;
    let passes = nodes_where(&graph, |n| is_stage(n, StageKind::Detection));
    assert_eq!(passes.len(), 4);
    let levels: Vec<HintLevel> = outcome
        .report
        .hint_escalations
        .iter()
        .map(|d| d.level)
        .collect();
    assert_eq!(levels, vec![HintLevel::Low, HintLevel::Medium, HintLevel::High]);
    assert_eq!(outcome.report.coverage.hint_level, HintLevel::High);

    let hinted = producer.requests_where(|r| {
        r.kind == TaskKind::stage(StageKind::Detection) && r.hint.is_some()
    });
    assert_eq!(hinted.len(), 3);

    // Consolidation waits on the last pass.
    let consolidate = nodes_where(&graph, |n| n.kind == TaskKind::Consolidate);
    let last_pass = passes.last().unwrap();
    assert_eq!(graph.dependencies(&consolidate[0].id), vec![last_pass.id]);
    assert_eq!(outcome.status, RunStatus::Complete);
}

/// Test: Coverage below a blocking threshold stops detection
/// Given a detection stage that reviews one of two entrypoints
/// When the detection policy blocks below 0.9
/// Then fix cycles run out and the run is blocked on coverage
#[tokio::test]
async fn test_blocking_coverage_policy() {
    let script = Script {
        detection_reviewed: 1,
        ..Script::default()
    };
    let mut coverage = BTreeMap::new();
    coverage.insert("detection".to_string(), CoveragePolicy::block_below(0.9));
    let config = PipelineConfig {
        coverage,
        max_fix_iterations: 1,
        ..test_config()
    };
    let (orchestrator, _producer) = scripted(script, config);
    let outcome = orchestrator.run(seeds()).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Blocked);
    assert_eq!(outcome.report.blocked.len(), 1);
    assert!(outcome.report.blocked[0].reason.contains("detection coverage 0.50"));
    let graph = outcome.graph.read().await;
    let report = nodes_where(&graph, |n| is_stage(n, StageKind::Report));
    assert_eq!(report[0].status, TaskStatus::Pending);
}

/// Test: One node at a time still completes
/// Given max_parallel of 1
/// When the standard plan runs
/// Then the run completes with the same graph as a parallel run
#[tokio::test]
async fn test_serial_run_matches_parallel_shape() {
    let config = PipelineConfig {
        max_parallel: 1,
        ..test_config()
    };
    let (orchestrator, producer) = scripted(Script::default(), config);
    let outcome = orchestrator.run(seeds()).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Complete);
    assert_eq!(outcome.graph.read().await.len(), 16);
    // Bundles and consolidation stay in the control loop.
    assert_eq!(producer.requests().len(), 12);
}

/// Test: Run records are persisted
/// Given an orchestrator persisting to a temp directory
/// When a run finishes
/// Then run.json, graph.json, report.json and artifact files exist and load
#[tokio::test]
async fn test_run_records_persisted() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, _producer) = scripted(Script::default(), test_config());
    let orchestrator = orchestrator.persist_to(dir.path());
    let outcome = orchestrator.run(seeds()).await.unwrap();

    let run_dir = RunDirectory::new(dir.path(), outcome.run_id);
    assert!(run_dir.report_path().exists());
    assert!(run_dir.path().join("artifacts").is_dir());

    let meta = run_dir.load_metadata().unwrap();
    assert_eq!(meta.status, RunStatus::Complete);
    assert!(meta.stages.values().all(|s| s == "completed"));
    assert_eq!(meta.counts.completed, 16);

    let graph = run_dir.load_graph().unwrap();
    assert_eq!(graph.len(), 16);
    assert!(graph.is_acyclic());

    let store = outcome.store.read().await;
    assert!(store.exists(outcome.run_id, LEDGER_ARTIFACT));
    assert!(store.exists(outcome.run_id, COVERAGE_ARTIFACT));
    // Seeds plus everything produced; every version is on disk.
    let files = std::fs::read_dir(run_dir.path().join("artifacts")).unwrap().count();
    let versions: usize = store
        .latest_all(outcome.run_id)
        .iter()
        .map(|a| a.version as usize)
        .sum();
    assert_eq!(files, versions);
}
