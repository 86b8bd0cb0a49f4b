//! Bundle isolation tests.
//!
//! These tests check what each producer call was actually shown, at the
//! run level, and what the partitioner does with denied content.

use serde_json::json;

use gatekeep::artifact::{ArtifactDraft, ArtifactKind, ArtifactStore, Category, RunId};
use gatekeep::blindness::{BlindnessPartitioner, Bundle, BundleKind};
use gatekeep::core::{StageKind, TaskKind};
use gatekeep::dispute::Reviewer;
use gatekeep::orchestration::{PipelinePlan, RunStatus, LEDGER_ARTIFACT};

use crate::fixtures::{saw_category, scripted, seeds, test_config, Script};

/// Test: Codex review never sees the Opus report
/// Given a plan where the Codex bundle is built after the Opus review
/// When the Codex review is dispatched
/// Then its inputs hold no review_opus content although the store does
#[tokio::test]
async fn test_codex_review_blind_to_opus_report() {
    let plan = PipelinePlan::new()
        .stage("threat_model", StageKind::ThreatModel, "Threat model", &[])
        .stage("invariants", StageKind::Invariants, "Invariants", &["threat_model"])
        .bundle("bundle_opus", BundleKind::ReviewOpus, &["invariants"])
        .stage("review_opus", StageKind::ReviewOpus, "Opus review", &["bundle_opus"])
        .bundle("bundle_codex", BundleKind::ReviewCodex, &["review_opus"])
        .stage("review_codex", StageKind::ReviewCodex, "Codex review", &["bundle_codex"]);
    let (orchestrator, producer) = scripted(Script::default(), test_config());
    let orchestrator = orchestrator.with_plan(plan);
    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let store = outcome.store.read().await;
    let opus_report = store.get(outcome.run_id, "review_opus").unwrap();
    assert!(opus_report.has_category(Category::ReviewOpus));

    let codex = producer.requests_where(|r| r.kind == TaskKind::stage(StageKind::ReviewCodex));
    assert_eq!(codex.len(), 1);
    assert!(!saw_category(&codex[0], Category::ReviewOpus));
    assert!(codex[0].input("review_opus").is_none());
    // The reviewer still gets the code and the invariants.
    assert!(codex[0].input("code").is_some());
    assert!(codex[0].input("invariants").is_some());
}

/// Test: Spec compliance works from prose only
/// Given the standard plan with code among the seeds
/// When the spec compliance stage is dispatched
/// Then it sees spec prose, public API and invariants but no code
#[tokio::test]
async fn test_spec_compliance_never_sees_code() {
    let (orchestrator, producer) = scripted(Script::default(), test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let requests =
        producer.requests_where(|r| r.kind == TaskKind::stage(StageKind::SpecCompliance));
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    for denied in [Category::Code, Category::ReviewOpus, Category::ReviewCodex, Category::TestResults] {
        assert!(!saw_category(request, denied), "spec compliance saw {}", denied);
    }
    let mut names: Vec<&str> = request.inputs.iter().map(|a| a.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["invariant_mapping", "invariants", "public_api", "spec"]);
}

/// Test: Dispute reviewers stay isolated across rounds
/// Given a dispute that is UNCLEAR in round 1 and CONFIRMED in round 2
/// When both rounds are argued
/// Then each side sees its own earlier argument and nothing of the other side
#[tokio::test]
async fn test_dispute_reviewers_isolated_across_rounds() {
    let script = Script::default().verdict("F-001", &["UNCLEAR", "CONFIRMED"]);
    let (orchestrator, producer) = scripted(script, test_config());
    let outcome = orchestrator.run(seeds()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    for reviewer in Reviewer::both() {
        let requests = producer.requests_where(|r| {
            matches!(&r.kind, TaskKind::DisputeReview { reviewer: side, .. } if *side == reviewer)
        });
        assert_eq!(requests.len(), 2);
        for request in &requests {
            assert!(!saw_category(request, reviewer.other().category()));
            // Adjudication output weighs both sides, so neither side reads it.
            for input in &request.inputs {
                assert_ne!(input.kind, ArtifactKind::DisputeVerdict, "{}", input.name);
                assert_ne!(input.kind, ArtifactKind::Dispute, "{}", input.name);
            }
            // The subject is still undecided in every round a reviewer argues.
            if let Some(ledger) = request.input(LEDGER_ARTIFACT) {
                let confirmed = &ledger.json().unwrap()["confirmed"];
                assert!(!confirmed
                    .as_array()
                    .into_iter()
                    .flatten()
                    .any(|id| id == "F-001"));
            }
        }
        let round_two = &requests[1];
        assert!(round_two
            .inputs
            .iter()
            .all(|a| a.name != "dispute-F-001-r1.record" && a.name != "dispute-F-001-r1.verdict"));
        let own = format!("dispute-F-001-r1.argument.{}", reviewer);
        let other = format!("dispute-F-001-r1.argument.{}", reviewer.other());
        assert!(requests[1].input(&own).is_some());
        assert!(requests[1].input(&other).is_none());
    }
}

/// Test: The added-test writer never sees code
/// Given an UNCLEAR first round
/// When the added-test node is dispatched
/// Then its inputs hold no code
#[tokio::test]
async fn test_added_test_writer_blind_to_code() {
    let script = Script::default().verdict("F-001", &["UNCLEAR", "CONFIRMED"]);
    let (orchestrator, producer) = scripted(script, test_config());
    orchestrator.run(seeds()).await.unwrap();

    let requests = producer.requests_where(|r| matches!(r.kind, TaskKind::AddedTest { .. }));
    assert_eq!(requests.len(), 1);
    assert!(!saw_category(&requests[0], Category::Code));
    assert!(requests[0].input("spec").is_some());
}

/// Test: Mixed-category artifacts are excluded
/// Given an artifact tagged with both spec prose and code
/// When the spec compliance bundle is materialized
/// Then the artifact is left out while prose-only inputs are kept
#[test]
fn test_mixed_category_artifact_excluded() {
    let run_id = RunId::new();
    let mut store = ArtifactStore::in_memory();
    for seed in seeds() {
        store.put(run_id, seed, None).unwrap();
    }
    store
        .put(
            run_id,
            ArtifactDraft::new(
                "annotated_spec",
                ArtifactKind::Source,
                "spec with inline snippets",
                &[Category::SpecProse, Category::Code],
            ),
            None,
        )
        .unwrap();

    let partitioner = BlindnessPartitioner::standard().unwrap();
    let bundle = partitioner
        .materialize(BundleKind::SpecCompliance, &store, run_id)
        .unwrap();
    let names: Vec<&str> = bundle.included.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["public_api", "spec"]);
    assert!(partitioner
        .audit(&bundle, BundleKind::SpecCompliance, &store, run_id)
        .is_pass());
}

/// Test: A bundle carrying code fails the spec compliance audit
/// Given a spec compliance bundle with the code artifact slipped in
/// When the bundle is audited
/// Then the audit blocks and names the artifact and its category
#[test]
fn test_injected_code_fails_audit() {
    let run_id = RunId::new();
    let mut store = ArtifactStore::in_memory();
    for seed in seeds() {
        store.put(run_id, seed, None).unwrap();
    }
    let partitioner = BlindnessPartitioner::standard().unwrap();
    let clean = partitioner
        .materialize(BundleKind::SpecCompliance, &store, run_id)
        .unwrap();

    let code = store.get(run_id, "code").unwrap().reference();
    let mut included = clean.included.clone();
    included.push(code);
    let tampered = Bundle::new(BundleKind::SpecCompliance, included, clean.manifest.clone());

    let decision = partitioner.audit(&tampered, BundleKind::SpecCompliance, &store, run_id);
    assert!(!decision.is_pass());
    let reason = decision.reason().unwrap();
    assert!(reason.contains("code@v1"), "{}", reason);
    assert!(reason.contains("denied category code"), "{}", reason);
}

/// Test: A bundle audited as another kind fails
/// Given a review_opus bundle
/// When it is audited as a review_codex bundle
/// Then the audit blocks
#[test]
fn test_bundle_audited_as_wrong_kind() {
    let run_id = RunId::new();
    let mut store = ArtifactStore::in_memory();
    store
        .put(
            run_id,
            ArtifactDraft::new(
                "review_opus",
                ArtifactKind::ReviewReport,
                json!({ "findings": [] }),
                &[Category::ReviewOpus],
            ),
            None,
        )
        .unwrap();
    let partitioner = BlindnessPartitioner::standard().unwrap();
    let bundle = partitioner
        .materialize(BundleKind::ReviewOpus, &store, run_id)
        .unwrap();
    assert_eq!(bundle.included.len(), 1);
    assert!(!partitioner
        .audit(&bundle, BundleKind::ReviewCodex, &store, run_id)
        .is_pass());
}
