//! Property tests.
//!
//! Random operation sequences against the graph, coverage tracker,
//! dispute resolver and finding ledger, checking the properties each one
//! must keep no matter the order of events.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use proptest::prelude::*;

use gatekeep::artifact::RunId;
use gatekeep::core::{shared, NodeSpec, Reroute, StageKind, TaskGraph, TaskId, TaskKind};
use gatekeep::coverage::{CoverageRecord, CoverageTracker, HintLevel};
use gatekeep::dispute::{Dispute, DisputeResolver, Resolution, Verdict, VerdictRecord};
use gatekeep::finding::{
    CandidateInput, FindingLedger, FindingStatus, FindingUpdate, Severity,
};

#[derive(Debug, Clone)]
enum GraphOp {
    Add(Vec<usize>),
    Depend(usize, usize),
    Insert(usize),
}

fn graph_op() -> impl Strategy<Value = GraphOp> {
    prop_oneof![
        prop::collection::vec(any::<usize>(), 0..3).prop_map(GraphOp::Add),
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| GraphOp::Depend(a, b)),
        any::<usize>().prop_map(GraphOp::Insert),
    ]
}

fn spec(n: usize) -> NodeSpec {
    NodeSpec::new(format!("node {}", n), TaskKind::stage(StageKind::Detection))
}

fn verdict() -> impl Strategy<Value = Verdict> {
    prop_oneof![
        Just(Verdict::Confirmed),
        Just(Verdict::Disproven),
        Just(Verdict::Unclear),
    ]
}

fn status() -> impl Strategy<Value = FindingStatus> {
    prop_oneof![
        Just(FindingStatus::Open),
        Just(FindingStatus::FixedPendingVerify),
        Just(FindingStatus::Closed),
    ]
}

proptest! {
    /// Test: Graph mutations never create a cycle
    /// Given random additions, dependencies and insertions
    /// When each one is applied
    /// Then the graph stays acyclic and failed mutations change nothing
    #[test]
    fn prop_graph_stays_acyclic(ops in prop::collection::vec(graph_op(), 1..40)) {
        let mut graph = TaskGraph::new();
        let mut ids: Vec<TaskId> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            let (nodes, edges) = (graph.len(), graph.edge_count());
            match op {
                GraphOp::Add(picks) => {
                    let deps: BTreeSet<TaskId> = if ids.is_empty() {
                        BTreeSet::new()
                    } else {
                        picks.iter().map(|p| ids[p % ids.len()]).collect()
                    };
                    let deps: Vec<TaskId> = deps.into_iter().collect();
                    ids.push(graph.add_node(spec(step), &deps).unwrap());
                }
                GraphOp::Depend(a, b) if !ids.is_empty() => {
                    let node = ids[a % ids.len()];
                    let on = ids[b % ids.len()];
                    if graph.add_dependency(&node, &on).is_err() {
                        prop_assert_eq!(graph.edge_count(), edges);
                    } else {
                        prop_assert!(graph.has_dependency(&node, &on));
                    }
                }
                GraphOp::Insert(a) if !ids.is_empty() => {
                    let from = ids[a % ids.len()];
                    let to = graph.dependents(&from);
                    match graph.insert_and_rewire(spec(step), Reroute::new(from, to.clone())) {
                        Ok(id) => {
                            for target in &to {
                                prop_assert!(graph.has_dependency(target, &id));
                                prop_assert!(!graph.has_dependency(target, &from));
                            }
                            ids.push(id);
                        }
                        Err(_) => {
                            prop_assert_eq!(graph.len(), nodes);
                            prop_assert_eq!(graph.edge_count(), edges);
                        }
                    }
                }
                _ => {}
            }
            prop_assert!(graph.is_acyclic());
            prop_assert!(graph.topological_order().is_ok());
        }
    }

    /// Test: Coverage counts and hint level only grow
    /// Given random reported records and pass boundaries
    /// When they are absorbed in order
    /// Then no count and no hint level ever decreases
    #[test]
    fn prop_coverage_is_monotonic(
        events in prop::collection::vec((0u64..10, 0u64..10, 0u64..10, 0u64..10, any::<bool>()), 1..30)
    ) {
        let mut tracker = CoverageTracker::new(RunId::new());
        let mut previous = tracker.record();

        for (total, reviewed, candidates, validated, close_pass) in events {
            tracker.absorb(&CoverageRecord {
                entrypoints_total: total,
                entrypoints_reviewed: reviewed,
                high_med_candidates: candidates,
                validated_high_med: validated,
                hint_level: HintLevel::None,
            });
            if close_pass {
                tracker.finish_pass();
            }
            let current = tracker.record();
            prop_assert!(current.entrypoints_total >= previous.entrypoints_total);
            prop_assert!(current.entrypoints_reviewed >= previous.entrypoints_reviewed);
            prop_assert!(current.high_med_candidates >= previous.high_med_candidates);
            prop_assert!(current.validated_high_med >= previous.validated_high_med);
            prop_assert!(current.hint_level >= previous.hint_level);
            prop_assert!(tracker.escalations().len() <= 3);
            previous = current;
        }
    }

    /// Test: Every dispute terminates within the round budget
    /// Given any sequence of verdicts and a budget of 1 to 5 rounds
    /// When rounds are resolved until a terminal resolution
    /// Then no more than the budget is used and escalation happens only at it
    #[test]
    fn prop_dispute_terminates(
        verdicts in prop::collection::vec(verdict(), 1..10),
        max_rounds in 1u32..=5,
    ) {
        let resolver = DisputeResolver::new(max_rounds);
        let mut dispute = Dispute::open("F-001");
        let mut rounds = 0;

        let terminal = loop {
            rounds += 1;
            prop_assert!(rounds <= max_rounds);
            let v = verdicts[(dispute.round as usize - 1) % verdicts.len()];
            let record = VerdictRecord {
                finding_id: "F-001".to_string(),
                verdict: v,
                reproduction_ref: Some("repro/F-001".to_string()),
                refutation_ref: Some("refute/F-001".to_string()),
                rationale: None,
            };
            match resolver.resolve_record(&mut dispute, &record) {
                Resolution::Rerun { next } => {
                    prop_assert_eq!(next.round, dispute.round + 1);
                    prop_assert_eq!(next.supersedes.as_ref(), Some(&dispute.id));
                    dispute = next;
                }
                other => break other,
            }
        };
        prop_assert!(terminal.is_terminal());
        if let Resolution::Escalate { round, .. } = terminal {
            prop_assert_eq!(round, max_rounds);
        }
    }

    /// Test: The ledger never holds an unproven closure
    /// Given random status updates with or without evidence
    /// When each is applied
    /// Then every CLOSED finding has a regression test and verifier confirmation
    #[test]
    fn prop_ledger_closure_holds(
        updates in prop::collection::vec((status(), any::<bool>(), any::<bool>()), 1..20)
    ) {
        let mut ledger = FindingLedger::new();
        let summary = ledger.consolidate(vec![(
            "review_opus".to_string(),
            vec![CandidateInput::new("Overflow", Severity::High, Some("src/a.rs"))],
        )]);
        ledger.confirm(&summary.new[0], "repro/1").unwrap();

        for (status, with_test, verified) in updates {
            let update = FindingUpdate {
                finding_id: summary.new[0].clone(),
                status,
                regression_test_ref: with_test.then(|| "tests/regression.rs".to_string()),
                verifier_confirmed: verified,
            };
            let _ = ledger.apply(&update);
            prop_assert!(ledger.verify().is_ok());
            for finding in ledger.findings() {
                if finding.status == FindingStatus::Closed {
                    prop_assert!(finding.regression_test_ref.is_some());
                    prop_assert!(finding.verifier_confirmed);
                }
            }
        }
    }
}

/// Test: Concurrent claimers never share a node
/// Given a layered graph shared between eight workers
/// When workers claim, yield and complete until nothing is left
/// Then every node is claimed exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let mut graph = TaskGraph::new();
    let mut previous: Vec<TaskId> = Vec::new();
    for layer in 0..5 {
        let mut current = Vec::new();
        for i in 0..8 {
            let deps: Vec<TaskId> = previous.iter().copied().filter(|d| d.seq() % 2 == i % 2).collect();
            current.push(graph.add_node(spec(layer * 8 + i as usize), &deps).unwrap());
        }
        previous = current;
    }
    let total = graph.len();
    let graph = shared(graph);

    let mut workers = Vec::new();
    for _ in 0..8 {
        let graph = Arc::clone(&graph);
        workers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let next = graph.write().await.claim_next();
                match next {
                    Some(id) => {
                        claimed.push(id);
                        tokio::task::yield_now().await;
                        graph.write().await.complete(&id, BTreeMap::new()).unwrap();
                    }
                    None => {
                        let counts = graph.read().await.counts();
                        if counts.pending == 0 && counts.in_progress == 0 {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    let unique: BTreeSet<TaskId> = all.iter().copied().collect();
    assert_eq!(all.len(), total);
    assert_eq!(unique.len(), total);
    assert_eq!(graph.read().await.counts().completed, total);
}
