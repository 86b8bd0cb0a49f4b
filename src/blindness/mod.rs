//! Content-blindness partitioning.
//!
//! Each consumer of the pipeline sees a bundle: a filtered view of the
//! run's artifacts chosen by content category. A bundle kind declares
//! which categories it allows and which it must never see. Selection
//! (`materialize`) and checking (`audit`) are implemented separately so
//! that a selection bug cannot pass its own check.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactDraft, ArtifactKind, ArtifactRef, ArtifactStore, Category, RunId};
use crate::error::{Error, Result};
use crate::gate::Decision;

/// Consumers that receive a filtered bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleKind {
    SpecCompliance,
    ReviewOpus,
    ReviewCodex,
    TestAuthoring,
    Adjudication,
}

impl BundleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleKind::SpecCompliance => "spec-compliance",
            BundleKind::ReviewOpus => "review-opus",
            BundleKind::ReviewCodex => "review-codex",
            BundleKind::TestAuthoring => "test-authoring",
            BundleKind::Adjudication => "adjudication",
        }
    }

    pub fn all() -> [BundleKind; 5] {
        [
            BundleKind::SpecCompliance,
            BundleKind::ReviewOpus,
            BundleKind::ReviewCodex,
            BundleKind::TestAuthoring,
            BundleKind::Adjudication,
        ]
    }
}

impl std::fmt::Display for BundleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BundleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BundleKind::all()
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown bundle kind: {}", s))
    }
}

/// Allowed and denied categories for one bundle kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub allow: BTreeSet<Category>,
    pub deny: BTreeSet<Category>,
}

impl Policy {
    pub fn new(allow: &[Category], deny: &[Category]) -> Self {
        Self {
            allow: allow.iter().copied().collect(),
            deny: deny.iter().copied().collect(),
        }
    }

    /// An artifact qualifies when it declares at least one category and
    /// every one of them is allowed.
    pub fn permits(&self, categories: &BTreeSet<Category>) -> bool {
        !categories.is_empty()
            && categories.is_subset(&self.allow)
            && categories.is_disjoint(&self.deny)
    }

    pub fn denied_in(&self, categories: &BTreeSet<Category>) -> Vec<Category> {
        categories.intersection(&self.deny).copied().collect()
    }

    pub fn outside_allow(&self, categories: &BTreeSet<Category>) -> Vec<Category> {
        categories.difference(&self.allow).copied().collect()
    }
}

/// Policies for every bundle kind.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: BTreeMap<BundleKind, Policy>,
}

impl PolicyTable {
    /// Build a table, rejecting any policy whose allow and deny sets
    /// overlap.
    pub fn new(policies: impl IntoIterator<Item = (BundleKind, Policy)>) -> Result<Self> {
        let policies: BTreeMap<BundleKind, Policy> = policies.into_iter().collect();
        for (kind, policy) in &policies {
            let overlap: Vec<&str> = policy
                .allow
                .intersection(&policy.deny)
                .map(|c| c.as_str())
                .collect();
            if !overlap.is_empty() {
                return Err(Error::Policy(format!(
                    "{} both allows and denies {}",
                    kind,
                    overlap.join(", ")
                )));
            }
        }
        Ok(Self { policies })
    }

    pub fn standard() -> Result<Self> {
        use Category::*;
        let reviewer_view = [
            SpecProse,
            Code,
            InvariantList,
            PublicApi,
            ThreatModel,
            TestResults,
            Findings,
        ];
        let mut opus = reviewer_view.to_vec();
        opus.push(ReviewOpus);
        let mut codex = reviewer_view.to_vec();
        codex.push(ReviewCodex);

        Self::new([
            (
                BundleKind::SpecCompliance,
                Policy::new(
                    &[SpecProse, InvariantList, PublicApi],
                    &[Code, ReviewOpus, ReviewCodex, TestResults],
                ),
            ),
            (BundleKind::ReviewOpus, Policy::new(&opus, &[ReviewCodex])),
            (BundleKind::ReviewCodex, Policy::new(&codex, &[ReviewOpus])),
            (
                BundleKind::TestAuthoring,
                Policy::new(
                    &[SpecProse, InvariantList, PublicApi, ThreatModel, Findings],
                    &[Code],
                ),
            ),
            (
                BundleKind::Adjudication,
                Policy::new(
                    &[
                        SpecProse,
                        Code,
                        ReviewOpus,
                        ReviewCodex,
                        TestResults,
                        Findings,
                        Reproduction,
                    ],
                    &[],
                ),
            ),
        ])
    }

    pub fn policy(&self, kind: BundleKind) -> Result<&Policy> {
        self.policies
            .get(&kind)
            .ok_or_else(|| Error::Policy(format!("no policy declared for {}", kind)))
    }
}

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub reference: ArtifactRef,
    pub kind: ArtifactKind,
    pub categories: BTreeSet<Category>,
}

/// Record of what a bundle was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub target_kind: BundleKind,
    pub entries: Vec<BundleEntry>,
}

/// A materialized, filtered view of a run's artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub target_kind: BundleKind,
    pub included: Vec<ArtifactRef>,
    pub manifest: BundleManifest,
}

impl Bundle {
    pub fn new(target_kind: BundleKind, included: Vec<ArtifactRef>, manifest: BundleManifest) -> Self {
        Self {
            target_kind,
            included,
            manifest,
        }
    }

    pub fn includes(&self, reference: &ArtifactRef) -> bool {
        self.included.contains(reference)
    }

    pub fn manifest_name(kind: BundleKind) -> String {
        format!("bundle.{}", kind)
    }

    /// The manifest as a storable artifact.
    ///
    /// It carries no content category, so no later bundle can select it.
    pub fn manifest_draft(&self) -> Result<ArtifactDraft> {
        Ok(ArtifactDraft::new(
            Self::manifest_name(self.target_kind),
            ArtifactKind::BundleManifest,
            serde_json::to_value(&self.manifest)?,
            &[],
        ))
    }

    /// Rebuild a bundle from a stored manifest.
    pub fn from_manifest(manifest: BundleManifest) -> Self {
        let included = manifest.entries.iter().map(|e| e.reference.clone()).collect();
        Self::new(manifest.target_kind, included, manifest)
    }
}

/// Builds and audits bundles against a policy table.
#[derive(Debug, Clone)]
pub struct BlindnessPartitioner {
    table: PolicyTable,
}

impl BlindnessPartitioner {
    pub fn new(table: PolicyTable) -> Self {
        Self { table }
    }

    pub fn standard() -> Result<Self> {
        Ok(Self::new(PolicyTable::standard()?))
    }

    pub fn table(&self) -> &PolicyTable {
        &self.table
    }

    /// Select the latest version of every artifact `kind` may see.
    pub fn materialize(&self, kind: BundleKind, store: &ArtifactStore, run_id: RunId) -> Result<Bundle> {
        let policy = self.table.policy(kind)?;
        let entries: Vec<BundleEntry> = store
            .latest_all(run_id)
            .into_iter()
            .filter(|artifact| policy.permits(&artifact.categories))
            .map(|artifact| BundleEntry {
                reference: artifact.reference(),
                kind: artifact.kind,
                categories: artifact.categories.clone(),
            })
            .collect();
        let included = entries.iter().map(|e| e.reference.clone()).collect();
        tracing::debug!(
            run_id = %run_id.short(),
            bundle = %kind,
            artifacts = entries.len(),
            "bundle materialized"
        );
        Ok(Bundle::new(
            kind,
            included,
            BundleManifest {
                target_kind: kind,
                entries,
            },
        ))
    }

    /// Check a bundle against `kind`'s policy using the categories the
    /// store holds for each included artifact.
    pub fn audit(
        &self,
        bundle: &Bundle,
        kind: BundleKind,
        store: &ArtifactStore,
        run_id: RunId,
    ) -> Decision {
        if bundle.target_kind != kind {
            return Decision::block(
                format!(
                    "bundle built for {} audited as {}",
                    bundle.target_kind, kind
                ),
                Vec::new(),
            );
        }
        let policy = match self.table.policy(kind) {
            Ok(policy) => policy,
            Err(err) => return Decision::block(err.to_string(), Vec::new()),
        };

        let mut decision = Decision::Pass;
        for reference in &bundle.included {
            let artifact = match store.get_ref(run_id, reference) {
                Ok(artifact) => artifact,
                Err(_) => {
                    decision = decision.merge(Decision::block(
                        format!("bundle {} includes {} which is not in the store", kind, reference),
                        vec![reference.to_string()],
                    ));
                    continue;
                }
            };
            for category in policy.denied_in(&artifact.categories) {
                decision = decision.merge(Decision::block(
                    format!(
                        "bundle {} contains {} with denied category {}",
                        kind, reference, category
                    ),
                    Vec::new(),
                ));
            }
            let outside: Vec<&str> = policy
                .outside_allow(&artifact.categories)
                .into_iter()
                .filter(|c| !policy.deny.contains(c))
                .map(|c| c.as_str())
                .collect();
            if !outside.is_empty() {
                decision = decision.merge(Decision::block(
                    format!(
                        "bundle {} contains {} with category {} outside its allow-list",
                        kind,
                        reference,
                        outside.join(", ")
                    ),
                    Vec::new(),
                ));
            }
            if artifact.categories.is_empty() {
                decision = decision.merge(Decision::block(
                    format!("bundle {} contains {} which declares no category", kind, reference),
                    Vec::new(),
                ));
            }
        }

        decision = decision.merge(check_manifest(bundle, store, run_id));
        if decision.is_pass() {
            tracing::debug!(run_id = %run_id.short(), bundle = %kind, "bundle audit passed");
        } else {
            tracing::warn!(run_id = %run_id.short(), bundle = %kind, %decision, "bundle audit blocked");
        }
        decision
    }
}

fn check_manifest(bundle: &Bundle, store: &ArtifactStore, run_id: RunId) -> Decision {
    let listed: BTreeSet<&ArtifactRef> = bundle.manifest.entries.iter().map(|e| &e.reference).collect();
    let included: BTreeSet<&ArtifactRef> = bundle.included.iter().collect();
    if listed != included || bundle.manifest.target_kind != bundle.target_kind {
        return Decision::block(
            format!("bundle {} manifest does not match its contents", bundle.target_kind),
            Vec::new(),
        );
    }
    let mismatched: Vec<String> = bundle
        .manifest
        .entries
        .iter()
        .filter(|entry| {
            store
                .get_ref(run_id, &entry.reference)
                .is_ok_and(|artifact| artifact.categories != entry.categories)
        })
        .map(|entry| entry.reference.to_string())
        .collect();
    if mismatched.is_empty() {
        Decision::Pass
    } else {
        Decision::block(
            format!(
                "bundle {} manifest misstates categories of {}",
                bundle.target_kind,
                mismatched.join(", ")
            ),
            Vec::new(),
        )
    }
}
