//! Graph mutations the orchestrator applies when something goes wrong or
//! a dispute needs another round.
//!
//! Each helper only touches the graph, so the shapes they build are
//! tested here without a producer.

use crate::core::graph::{Reroute, TaskGraph};
use crate::core::task::{NodeSpec, StageKind, TaskId, TaskKind, TaskNode};
use crate::coverage::HintDirective;
use crate::dispute::{Dispute, DisputeId, Reviewer};
use crate::Result;

pub const META_ATTEMPT: &str = "attempt";
pub const META_FIX_ITERATION: &str = "fix_iteration";
pub const META_FEEDBACK: &str = "feedback";
pub const META_HINT: &str = "hint";
pub const META_DETECTION_PASS: &str = "detection_pass";
pub const META_FINDING: &str = "finding_id";
pub const META_ROUND: &str = "round";
pub const META_REGENERATION: &str = "regeneration";
pub const META_SUPERSEDES: &str = "supersedes";

pub fn meta_u32(node: &TaskNode, key: &str) -> u32 {
    node.metadata
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// Fix and re-validation nodes inserted after a blocked gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixCycle {
    pub fix: TaskId,
    pub revalidate: TaskId,
}

/// Put a fix node and a re-validation node behind `gated`, and move
/// every node waiting on `gated` behind the re-validation.
pub fn insert_fix_cycle(
    graph: &mut TaskGraph,
    gated: TaskId,
    origin: &TaskNode,
    iteration: u32,
    reason: &str,
) -> Result<FixCycle> {
    let downstream = graph.dependents(&gated);
    let fix = graph.insert_and_rewire(
        NodeSpec::new(
            format!("Fix {} (iteration {})", origin.title, iteration),
            TaskKind::Fix { origin: origin.id },
        )
        .with_meta(META_FIX_ITERATION, iteration)
        .with_meta(META_FEEDBACK, reason),
        Reroute::new(gated, downstream.clone()),
    )?;
    let revalidate = graph.insert_and_rewire(
        NodeSpec::new(
            format!("Re-validate {} (iteration {})", origin.title, iteration),
            TaskKind::Revalidate { origin: origin.id },
        )
        .with_meta(META_FIX_ITERATION, iteration),
        Reroute::new(fix, downstream),
    )?;
    tracing::info!(origin = %origin.id, %fix, %revalidate, iteration, "fix cycle inserted");
    Ok(FixCycle { fix, revalidate })
}

/// Block `failed` and supersede it with a fresh copy one attempt later.
pub fn retry_node(graph: &mut TaskGraph, failed: &TaskNode, counter: &str, reason: &str) -> Result<TaskId> {
    graph.block(&failed.id, reason)?;
    let mut spec = NodeSpec::new(failed.title.clone(), failed.kind.clone());
    spec.metadata = failed.metadata.clone();
    spec.metadata.remove(META_SUPERSEDES);
    let spec = spec.with_meta(counter, meta_u32(failed, counter) + 1);
    let replacement = graph.supersede(&failed.id, spec)?;
    tracing::info!(failed = %failed.id, %replacement, counter, "node superseded");
    Ok(replacement)
}

/// Another detection pass carrying `directive`, placed between `after`
/// and its dependents.
pub fn insert_detection_pass(
    graph: &mut TaskGraph,
    after: TaskId,
    pass: u32,
    directive: &HintDirective,
) -> Result<TaskId> {
    let downstream = graph.dependents(&after);
    let hint = serde_json::to_value(directive)?;
    graph.insert_and_rewire(
        NodeSpec::new(
            format!("Detection pass {} (hint {})", pass, directive.level),
            TaskKind::stage(StageKind::Detection),
        )
        .with_meta(META_DETECTION_PASS, pass)
        .with_meta(META_HINT, hint),
        Reroute::new(after, downstream),
    )
}

/// Nodes of one dispute round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeNodes {
    pub opus: TaskId,
    pub codex: TaskId,
    pub resolve: TaskId,
    pub added_test: Option<TaskId>,
}

fn dispute_round(
    graph: &mut TaskGraph,
    dispute: &Dispute,
    title: &str,
    after: TaskId,
) -> Result<(TaskId, TaskId, TaskId)> {
    let mut reviews = Vec::with_capacity(2);
    for reviewer in Reviewer::both() {
        let spec = NodeSpec::new(
            format!("{} argues {} (round {})", reviewer, title, dispute.round),
            TaskKind::DisputeReview {
                dispute: dispute.id.clone(),
                reviewer,
            },
        )
        .with_meta(META_FINDING, dispute.subject_finding_id.as_str())
        .with_meta(META_ROUND, dispute.round);
        reviews.push(graph.add_node(spec, &[after])?);
    }
    let resolve = graph.add_node(
        NodeSpec::new(
            format!("Adjudicate {} (round {})", title, dispute.round),
            TaskKind::DisputeResolve {
                dispute: dispute.id.clone(),
            },
        )
        .with_meta(META_FINDING, dispute.subject_finding_id.as_str())
        .with_meta(META_ROUND, dispute.round),
        &reviews,
    )?;
    Ok((reviews[0], reviews[1], resolve))
}

/// First round of a dispute: both reviews wait on `consolidate`, and every
/// node in `downstream` additionally waits on the resolution.
pub fn open_dispute(
    graph: &mut TaskGraph,
    consolidate: TaskId,
    downstream: &[TaskId],
    dispute: &Dispute,
    title: &str,
) -> Result<DisputeNodes> {
    let (opus, codex, resolve) = dispute_round(graph, dispute, title, consolidate)?;
    for node in downstream {
        graph.add_dependency(node, &resolve)?;
    }
    tracing::debug!(dispute = %dispute.id, %resolve, "dispute opened");
    Ok(DisputeNodes {
        opus,
        codex,
        resolve,
        added_test: None,
    })
}

/// Next round after an UNCLEAR verdict: an added-test node behind the
/// previous resolution, then a fresh review pair and resolution. Whatever
/// waited on the previous resolution waits on the new one.
pub fn rerun_dispute(
    graph: &mut TaskGraph,
    resolved: TaskId,
    previous: &DisputeId,
    next: &Dispute,
    title: &str,
) -> Result<DisputeNodes> {
    let downstream = graph.dependents(&resolved);
    let added_test = graph.add_node(
        NodeSpec::new(
            format!("Add test for {} before round {}", title, next.round),
            TaskKind::AddedTest {
                dispute: previous.clone(),
            },
        )
        .with_meta(META_FINDING, next.subject_finding_id.as_str())
        .with_meta(META_ROUND, next.round),
        &[resolved],
    )?;
    let (opus, codex, resolve) = dispute_round(graph, next, title, added_test)?;
    for node in &downstream {
        graph.rewire(node, &resolved, &resolve)?;
    }
    tracing::debug!(dispute = %next.id, %resolve, "dispute rerun inserted");
    Ok(DisputeNodes {
        opus,
        codex,
        resolve,
        added_test: Some(added_test),
    })
}
