//! Gate validation.
//!
//! A gate inspects artifacts before the graph is allowed to progress.
//! Validators are pure: they read an artifact (and any related artifacts
//! the caller passes in), never the store or the clock, and return a
//! `Decision`. Expected failures such as a missing field are decisions,
//! not errors.

mod rules;
mod standard;

pub use rules::{Rule, RuleSet};
pub use standard::{FindingUpdatesValidator, InvariantMappingValidator, ReplayRecordValidator};

use crate::artifact::{Artifact, ArtifactKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of a gate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    Pass,
    Block {
        /// Human-readable explanation, sufficient to act on.
        reason: String,
        /// Names of missing required items.
        #[serde(default)]
        missing: Vec<String>,
    },
}

impl Decision {
    pub fn block(reason: impl Into<String>, missing: Vec<String>) -> Self {
        Decision::Block {
            reason: reason.into(),
            missing,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Decision::Pass)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Pass => None,
            Decision::Block { reason, .. } => Some(reason),
        }
    }

    pub fn missing(&self) -> &[String] {
        match self {
            Decision::Pass => &[],
            Decision::Block { missing, .. } => missing,
        }
    }

    /// Combine two decisions; any block wins and block details accumulate.
    pub fn merge(self, other: Decision) -> Decision {
        match (self, other) {
            (Decision::Pass, other) => other,
            (this, Decision::Pass) => this,
            (
                Decision::Block {
                    reason: r1,
                    missing: mut m1,
                },
                Decision::Block {
                    reason: r2,
                    missing: m2,
                },
            ) => {
                for item in m2 {
                    if !m1.contains(&item) {
                        m1.push(item);
                    }
                }
                Decision::Block {
                    reason: format!("{}; {}", r1, r2),
                    missing: m1,
                }
            }
        }
    }

    /// Merge every decision, passing only when all pass.
    pub fn all(decisions: impl IntoIterator<Item = Decision>) -> Decision {
        decisions.into_iter().fold(Decision::Pass, Decision::merge)
    }

    /// Prefix a block reason with where it came from.
    pub fn context(self, prefix: &str) -> Decision {
        match self {
            Decision::Pass => Decision::Pass,
            Decision::Block { reason, missing } => Decision::Block {
                reason: format!("{}: {}", prefix, reason),
                missing,
            },
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Pass => write!(f, "PASS"),
            Decision::Block { reason, missing } if missing.is_empty() => {
                write!(f, "BLOCK: {}", reason)
            }
            Decision::Block { reason, missing } => {
                write!(f, "BLOCK: {} (missing: {})", reason, missing.join(", "))
            }
        }
    }
}

/// What a validator sees: the artifact under test plus related
/// artifacts for cross-document rules.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub artifact: &'a Artifact,
    pub related: &'a [&'a Artifact],
}

impl<'a> GateInput<'a> {
    pub fn new(artifact: &'a Artifact, related: &'a [&'a Artifact]) -> Self {
        Self { artifact, related }
    }

    /// First related artifact of `kind`.
    pub fn related_of_kind(&self, kind: ArtifactKind) -> Option<&'a Artifact> {
        self.related.iter().copied().find(|a| a.kind == kind)
    }
}

/// A single gate rule set for one artifact kind.
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, input: &GateInput<'_>) -> Decision;
}

/// Runs several validators and merges their decisions.
pub struct AllOf {
    name: String,
    validators: Vec<Box<dyn Validator>>,
}

impl AllOf {
    pub fn new(name: &str, validators: Vec<Box<dyn Validator>>) -> Self {
        Self {
            name: name.to_string(),
            validators,
        }
    }
}

impl Validator for AllOf {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, input: &GateInput<'_>) -> Decision {
        Decision::all(self.validators.iter().map(|v| v.validate(input)))
    }
}

/// Registry of validators keyed by artifact kind.
#[derive(Default)]
pub struct GateValidator {
    validators: BTreeMap<ArtifactKind, Vec<Box<dyn Validator>>>,
}

impl GateValidator {
    /// An empty registry; every kind passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in rule set for every pipeline artifact kind.
    pub fn standard() -> Self {
        let mut gate = Self::new();
        gate.register(ArtifactKind::CoverageRecord, Box::new(standard::coverage_record()));
        gate.register(ArtifactKind::ThreatModel, Box::new(standard::threat_model()));
        gate.register(ArtifactKind::InvariantList, Box::new(standard::invariant_list()));
        gate.register(ArtifactKind::InvariantMapping, Box::new(InvariantMappingValidator));
        gate.register(
            ArtifactKind::SpecComplianceReport,
            Box::new(standard::spec_compliance_report()),
        );
        gate.register(ArtifactKind::ReviewReport, Box::new(standard::review_report()));
        gate.register(ArtifactKind::DisputeArgument, Box::new(standard::dispute_argument()));
        gate.register(ArtifactKind::DisputeVerdict, Box::new(standard::dispute_verdict()));
        gate.register(ArtifactKind::ReplayRecord, Box::new(ReplayRecordValidator));
        gate.register(ArtifactKind::FindingUpdates, Box::new(FindingUpdatesValidator));
        gate.register(ArtifactKind::TestCase, Box::new(standard::test_case()));
        gate.register(ArtifactKind::Report, Box::new(standard::report()));
        gate
    }

    /// Add a validator for `kind`; validators for one kind compose.
    pub fn register(&mut self, kind: ArtifactKind, validator: Box<dyn Validator>) {
        self.validators.entry(kind).or_default().push(validator);
    }

    pub fn has_rules(&self, kind: ArtifactKind) -> bool {
        self.validators.get(&kind).is_some_and(|v| !v.is_empty())
    }

    /// Validate one artifact on its own.
    pub fn validate(&self, kind: ArtifactKind, artifact: &Artifact) -> Decision {
        self.validate_with(kind, artifact, &[])
    }

    /// Validate one artifact with related documents available to
    /// cross-reference rules.
    pub fn validate_with(
        &self,
        kind: ArtifactKind,
        artifact: &Artifact,
        related: &[&Artifact],
    ) -> Decision {
        if artifact.kind != kind {
            return Decision::block(
                format!(
                    "{} declared as {} but validated as {}",
                    artifact.reference(),
                    artifact.kind,
                    kind
                ),
                Vec::new(),
            );
        }
        let Some(validators) = self.validators.get(&kind) else {
            return Decision::Pass;
        };
        let input = GateInput::new(artifact, related);
        Decision::all(validators.iter().map(|v| v.validate(&input)))
    }

    /// Validate a set of artifacts, each against its declared kind.
    pub fn validate_bundle(&self, artifacts: &[&Artifact], related: &[&Artifact]) -> Decision {
        Decision::all(artifacts.iter().map(|artifact| {
            self.validate_with(artifact.kind, artifact, related)
                .context(&artifact.reference().to_string())
        }))
    }
}
