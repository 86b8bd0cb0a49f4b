//! Failure handling and recovery integration tests.
//!
//! These tests verify that gate blocks get fix cycles, that producer
//! failures and timeouts get explicit retry nodes, and that cancellation
//! leaves a blocked run behind.

use std::time::Duration;

use gatekeep::artifact::Category;
use gatekeep::config::PipelineConfig;
use gatekeep::core::{StageKind, TaskKind, TaskStatus};
use gatekeep::finding::{Finding, FindingStatus};
use gatekeep::orchestration::{EscalationKind, RunStatus, LEDGER_ARTIFACT};

use crate::fixtures::{
    is_stage, labels, nodes_where, saw_category, scripted, seeds, test_config, Script,
};

/// Test: A gate block is answered by a fix cycle
/// Given an invariants stage whose first mapping leaves I-2 untested
/// When the gate blocks it
/// Then a fix node and a re-validation run and the bundles wait on the latter
#[tokio::test]
async fn test_gate_block_inserts_fix_cycle() {
    let script = Script::default().gate_fail(StageKind::Invariants);
    let (orchestrator, producer) = scripted(script, test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let graph = outcome.graph.read().await;
    let invariants = nodes_where(&graph, |n| is_stage(n, StageKind::Invariants));
    assert_eq!(invariants.len(), 1);
    let origin = &invariants[0];
    assert_eq!(origin.metadata["gate"], "block");
    assert!(origin.is_completed());

    let all = labels(&graph);
    let revalidate_label = format!("revalidate:{}", origin.id);
    assert!(all.contains(&format!("fix:{}", origin.id)));
    assert!(all.contains(&revalidate_label));
    let revalidate = nodes_where(&graph, |n| n.kind.label() == revalidate_label);
    assert_eq!(revalidate[0].metadata["gate"], "pass");
    for bundle in nodes_where(&graph, |n| matches!(n.kind, TaskKind::Bundle { .. })) {
        assert_eq!(graph.dependencies(&bundle.id), vec![revalidate[0].id]);
    }

    let fixes = producer.requests_where(|r| matches!(r.kind, TaskKind::Fix { .. }));
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].origin, Some(TaskKind::stage(StageKind::Invariants)));
    assert!(fixes[0].feedback.as_deref().unwrap().contains("I-2"));
    assert_eq!(fixes[0].input("invariant_mapping").unwrap().version, 1);

    let store = outcome.store.read().await;
    let mapping = store.get(outcome.run_id, "invariant_mapping").unwrap();
    assert_eq!(mapping.version, 2);
    assert!(mapping.has_category(Category::InvariantList));
}

/// Test: A fixed review keeps its reviewer's category
/// Given a Codex review whose first report has no findings array
/// When the fix node rewrites it
/// Then the new version is tagged review_codex and the fix never saw Opus output
#[tokio::test]
async fn test_review_fix_stays_blind() {
    let script = Script::default().gate_fail(StageKind::ReviewCodex);
    let (orchestrator, producer) = scripted(script, test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let fixes = producer.requests_where(|r| matches!(r.kind, TaskKind::Fix { .. }));
    assert_eq!(fixes.len(), 1);
    assert!(!saw_category(&fixes[0], Category::ReviewOpus));

    let store = outcome.store.read().await;
    let report = store.get(outcome.run_id, "review_codex").unwrap();
    assert_eq!(report.version, 2);
    assert!(report.has_category(Category::ReviewCodex));
    assert!(!report.has_category(Category::ReviewOpus));
}

/// Test: A closure without evidence never reaches the ledger
/// Given fix verification that first closes F-001 without a regression test
/// When the gate blocks it and the fix supplies the evidence
/// Then no ledger version ever holds an unproven CLOSED finding
#[tokio::test]
async fn test_closure_without_evidence_is_refused() {
    let script = Script::default().gate_fail(StageKind::VerifyFixes);
    let (orchestrator, _producer) = scripted(script, test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let graph = outcome.graph.read().await;
    let verify = nodes_where(&graph, |n| is_stage(n, StageKind::VerifyFixes));
    assert_eq!(verify[0].metadata["gate"], "block");
    assert!(verify[0].metadata["gate_reason"]
        .as_str()
        .unwrap()
        .contains("closure requirements unmet"));

    let store = outcome.store.read().await;
    for version in store.versions(outcome.run_id, LEDGER_ARTIFACT) {
        let findings: Vec<Finding> =
            serde_json::from_value(version.json().unwrap()["findings"].clone()).unwrap();
        for finding in findings.iter().filter(|f| f.status == FindingStatus::Closed) {
            assert!(finding.regression_test_ref.is_some());
            assert!(finding.verifier_confirmed);
        }
    }
    let closed = outcome
        .report
        .findings
        .iter()
        .find(|f| f.id == "F-001")
        .unwrap();
    assert_eq!(closed.status, FindingStatus::Closed);
}

/// Test: A producer failure gets an explicit retry node
/// Given a threat model stage that fails on its first attempt
/// When the failure is reported
/// Then the node is blocked, a retry with attempt 1 replaces it and the run completes
#[tokio::test]
async fn test_producer_failure_inserts_retry() {
    let script = Script::default().fail(StageKind::ThreatModel, 1);
    let (orchestrator, producer) = scripted(script, test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let graph = outcome.graph.read().await;
    let attempts = nodes_where(&graph, |n| is_stage(n, StageKind::ThreatModel));
    assert_eq!(attempts.len(), 2);
    match &attempts[0].status {
        TaskStatus::Blocked { reason } => assert!(reason.contains("scripted failure")),
        other => panic!("expected blocked, got {}", other),
    }
    assert!(attempts[1].is_completed());
    assert_eq!(attempts[1].metadata["attempt"], 1);
    assert_eq!(
        attempts[1].meta_str("supersedes"),
        Some(attempts[0].id.to_string().as_str())
    );
    // The superseded node is kept for audit but does not block the run.
    assert!(outcome.report.blocked.is_empty());
    assert_eq!(outcome.report.counts.blocked, 1);

    let retried = producer.requests_where(|r| r.kind == TaskKind::stage(StageKind::ThreatModel));
    let seen: Vec<u32> = retried.iter().map(|r| r.attempt).collect();
    assert_eq!(seen, vec![0, 1]);
}

/// Test: Exhausted retries escalate the run
/// Given a threat model stage that always fails
/// When the retry budget of 2 is spent
/// Then three attempts exist, the last stays blocked and the run is escalated
#[tokio::test]
async fn test_exhausted_retries_escalate() {
    let script = Script::default().fail(StageKind::ThreatModel, 10);
    let (orchestrator, _producer) = scripted(script, test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Escalated);

    let graph = outcome.graph.read().await;
    let attempts = nodes_where(&graph, |n| is_stage(n, StageKind::ThreatModel));
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|n| n.is_blocked()));

    let report = &outcome.report;
    assert_eq!(report.escalations.len(), 1);
    assert_eq!(report.escalations[0].kind, EscalationKind::Producer);
    assert_eq!(report.escalations[0].task, attempts[2].id);
    assert_eq!(report.blocked.len(), 1);
    let invariants = nodes_where(&graph, |n| is_stage(n, StageKind::Invariants));
    assert!(invariants[0].is_pending());
}

/// Test: A stuck producer call times out
/// Given a one-second node timeout and a threat model that stalls on attempt 0
/// When the deadline passes
/// Then the call counts as a failure and the retry completes the run
#[tokio::test]
async fn test_timeout_treated_as_failure() {
    let script = Script::default().stall(StageKind::ThreatModel, Duration::from_secs(10));
    let config = PipelineConfig {
        node_timeout_secs: 1,
        ..test_config()
    };
    let (orchestrator, _producer) = scripted(script, config);
    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let graph = outcome.graph.read().await;
    let attempts = nodes_where(&graph, |n| is_stage(n, StageKind::ThreatModel));
    assert_eq!(attempts.len(), 2);
    match &attempts[0].status {
        TaskStatus::Blocked { reason } => assert!(reason.contains("timed out"), "{}", reason),
        other => panic!("expected blocked, got {}", other),
    }
}

/// Test: Cancellation blocks in-flight nodes
/// Given a threat model call that never returns in time
/// When the run is cancelled
/// Then the in-flight node is blocked, the rest stay pending and the run is blocked
#[tokio::test]
async fn test_cancellation_blocks_in_flight() {
    let script = Script::default().stall(StageKind::ThreatModel, Duration::from_secs(60));
    let (orchestrator, _producer) = scripted(script, test_config());
    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Blocked);

    let graph = outcome.graph.read().await;
    let threat = nodes_where(&graph, |n| is_stage(n, StageKind::ThreatModel));
    assert_eq!(
        threat[0].status,
        TaskStatus::Blocked {
            reason: "run cancelled".to_string()
        }
    );
    assert_eq!(graph.counts().pending, 12);
}
