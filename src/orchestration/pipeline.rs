//! The declarative plan a run's graph is built from.

use std::collections::BTreeMap;

use crate::artifact::{ArtifactKind, Category};
use crate::blindness::BundleKind;
use crate::core::graph::TaskGraph;
use crate::core::task::{NodeSpec, StageKind, TaskId, TaskKind};
use crate::dispute::Reviewer;
use crate::{Error, Result};

/// One node of the static plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub key: String,
    pub spec: NodeSpec,
    /// Keys of earlier steps this one waits on.
    pub after: Vec<String>,
}

/// Ordered list of steps; a step may only wait on steps listed before it,
/// which keeps every plan acyclic.
#[derive(Debug, Clone, Default)]
pub struct PipelinePlan {
    steps: Vec<PlanStep>,
}

impl PipelinePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, key: &str, spec: NodeSpec, after: &[&str]) -> Self {
        self.steps.push(PlanStep {
            key: key.to_string(),
            spec,
            after: after.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn stage(self, key: &str, stage: StageKind, title: &str, after: &[&str]) -> Self {
        self.step(key, NodeSpec::new(title, TaskKind::stage(stage)), after)
    }

    pub fn bundle(self, key: &str, target: BundleKind, after: &[&str]) -> Self {
        self.step(
            key,
            NodeSpec::new(format!("Build {} bundle", target), TaskKind::Bundle { target }),
            after,
        )
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Threat model, invariants, three isolated reviews, detection,
    /// consolidation, exploit replay, fix verification, report.
    pub fn standard() -> Self {
        Self::new()
            .stage("threat_model", StageKind::ThreatModel, "Threat model", &[])
            .stage("invariants", StageKind::Invariants, "Invariants and test mapping", &["threat_model"])
            .bundle("bundle_spec", BundleKind::SpecCompliance, &["invariants"])
            .stage("spec_compliance", StageKind::SpecCompliance, "Spec compliance review", &["bundle_spec"])
            .bundle("bundle_opus", BundleKind::ReviewOpus, &["invariants"])
            .stage("review_opus", StageKind::ReviewOpus, "Opus review", &["bundle_opus"])
            .bundle("bundle_codex", BundleKind::ReviewCodex, &["invariants"])
            .stage("review_codex", StageKind::ReviewCodex, "Codex review", &["bundle_codex"])
            .stage(
                "detection",
                StageKind::Detection,
                "Detection pass",
                &["spec_compliance", "review_opus", "review_codex"],
            )
            .step(
                "consolidate",
                NodeSpec::new("Consolidate findings", TaskKind::Consolidate),
                &["detection"],
            )
            .stage("exploit_replay", StageKind::ExploitReplay, "Exploit replay", &["consolidate"])
            .stage("verify_fixes", StageKind::VerifyFixes, "Verify fixes", &["exploit_replay"])
            .stage("report", StageKind::Report, "Final report", &["verify_fixes"])
    }

    /// Add every step to `graph`, returning the id assigned to each key.
    pub fn instantiate(&self, graph: &mut TaskGraph) -> Result<BTreeMap<String, TaskId>> {
        let mut ids = BTreeMap::new();
        for step in &self.steps {
            if ids.contains_key(&step.key) {
                return Err(Error::Config(format!("duplicate plan step {}", step.key)));
            }
            let deps = step
                .after
                .iter()
                .map(|key| {
                    ids.get(key).copied().ok_or_else(|| {
                        Error::Config(format!(
                            "plan step {} waits on {}, which is not declared before it",
                            step.key, key
                        ))
                    })
                })
                .collect::<Result<Vec<TaskId>>>()?;
            let spec = step.spec.clone().with_meta("plan_step", step.key.as_str());
            let id = graph.add_node(spec, &deps)?;
            ids.insert(step.key.clone(), id);
        }
        Ok(ids)
    }
}

/// Artifact kinds a node must hand back before its gate can pass.
pub fn expected_outputs(kind: &TaskKind) -> &'static [ArtifactKind] {
    match kind {
        TaskKind::Stage { stage } => match stage {
            StageKind::ThreatModel => &[ArtifactKind::ThreatModel],
            StageKind::Invariants => &[ArtifactKind::InvariantList, ArtifactKind::InvariantMapping],
            StageKind::SpecCompliance => &[ArtifactKind::SpecComplianceReport],
            StageKind::ReviewOpus | StageKind::ReviewCodex => &[ArtifactKind::ReviewReport],
            StageKind::Detection => &[ArtifactKind::CoverageRecord],
            StageKind::ExploitReplay => &[ArtifactKind::ReplayRecord],
            StageKind::VerifyFixes => &[ArtifactKind::FindingUpdates],
            StageKind::Report => &[ArtifactKind::Report],
        },
        TaskKind::DisputeReview { .. } => &[ArtifactKind::DisputeArgument],
        TaskKind::DisputeResolve { .. } => &[ArtifactKind::DisputeVerdict],
        TaskKind::AddedTest { .. } => &[ArtifactKind::TestCase],
        TaskKind::Bundle { .. }
        | TaskKind::Consolidate
        | TaskKind::Fix { .. }
        | TaskKind::Revalidate { .. } => &[],
    }
}

/// Categories stamped onto every artifact a node of `kind` produces, on
/// top of whatever the producer declared.
pub fn declared_categories(kind: &TaskKind) -> &'static [Category] {
    match kind {
        TaskKind::Stage { stage } => match stage {
            StageKind::ThreatModel => &[Category::ThreatModel],
            StageKind::Invariants => &[Category::InvariantList],
            StageKind::SpecCompliance => &[Category::Findings],
            StageKind::ReviewOpus => &[Category::ReviewOpus],
            StageKind::ReviewCodex => &[Category::ReviewCodex],
            StageKind::Detection => &[Category::Findings],
            StageKind::ExploitReplay => &[Category::Reproduction],
            StageKind::VerifyFixes => &[Category::TestResults],
            StageKind::Report => &[],
        },
        TaskKind::DisputeReview {
            reviewer: Reviewer::Opus,
            ..
        } => &[Category::ReviewOpus],
        TaskKind::DisputeReview {
            reviewer: Reviewer::Codex,
            ..
        } => &[Category::ReviewCodex],
        // A verdict weighs both arguments, so neither reviewer may read it.
        TaskKind::DisputeResolve { .. } => {
            &[Category::Findings, Category::ReviewOpus, Category::ReviewCodex]
        }
        TaskKind::AddedTest { .. } => &[Category::TestResults],
        TaskKind::Bundle { .. }
        | TaskKind::Consolidate
        | TaskKind::Fix { .. }
        | TaskKind::Revalidate { .. } => &[],
    }
}

/// Bundle a consumer of `kind` reads its inputs from. Kinds without one
/// see every artifact of the run.
pub fn consumer_bundle(kind: &TaskKind) -> Option<BundleKind> {
    match kind {
        TaskKind::Stage {
            stage: StageKind::SpecCompliance,
        } => Some(BundleKind::SpecCompliance),
        TaskKind::Stage {
            stage: StageKind::ReviewOpus,
        } => Some(BundleKind::ReviewOpus),
        TaskKind::Stage {
            stage: StageKind::ReviewCodex,
        } => Some(BundleKind::ReviewCodex),
        TaskKind::DisputeReview { reviewer, .. } => Some(reviewer.bundle()),
        TaskKind::DisputeResolve { .. } => Some(BundleKind::Adjudication),
        TaskKind::AddedTest { .. } => Some(BundleKind::TestAuthoring),
        _ => None,
    }
}
