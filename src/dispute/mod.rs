//! Adversarial dispute resolution.
//!
//! Every HIGH/MED candidate is argued by two isolated reviewers and then
//! adjudicated. The resolver turns a verdict into the next step for the
//! orchestrator: confirm, disprove, rerun another round, or escalate once
//! the round budget is spent.

use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactKind, ArtifactRef, Category};
use crate::blindness::BundleKind;
use crate::gate::Decision;

/// Identifier of one round of a dispute over one finding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisputeId(String);

impl DisputeId {
    pub fn new(finding_id: &str, round: u32) -> Self {
        Self(format!("dispute-{}-r{}", finding_id, round))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DisputeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two isolated sides of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reviewer {
    Opus,
    Codex,
}

impl Reviewer {
    pub fn both() -> [Reviewer; 2] {
        [Reviewer::Opus, Reviewer::Codex]
    }

    /// Category the reviewer's output is tagged with.
    pub fn category(&self) -> Category {
        match self {
            Reviewer::Opus => Category::ReviewOpus,
            Reviewer::Codex => Category::ReviewCodex,
        }
    }

    /// Bundle the reviewer reads from.
    pub fn bundle(&self) -> BundleKind {
        match self {
            Reviewer::Opus => BundleKind::ReviewOpus,
            Reviewer::Codex => BundleKind::ReviewCodex,
        }
    }

    pub fn other(&self) -> Reviewer {
        match self {
            Reviewer::Opus => Reviewer::Codex,
            Reviewer::Codex => Reviewer::Opus,
        }
    }
}

impl std::fmt::Display for Reviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reviewer::Opus => write!(f, "opus"),
            Reviewer::Codex => write!(f, "codex"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Confirmed,
    Disproven,
    Unclear,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Confirmed => write!(f, "CONFIRMED"),
            Verdict::Disproven => write!(f, "DISPROVEN"),
            Verdict::Unclear => write!(f, "UNCLEAR"),
        }
    }
}

/// Body of a `dispute_verdict` artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub finding_id: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub reproduction_ref: Option<String>,
    #[serde(default)]
    pub refutation_ref: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// One round of adjudication over one finding.
///
/// A dispute is never mutated after its verdict is attached; an UNCLEAR
/// round is superseded by a new dispute with the next round number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub subject_finding_id: String,
    pub round: u32,
    pub opus_argument: Option<ArtifactRef>,
    pub codex_argument: Option<ArtifactRef>,
    pub verdict: Option<Verdict>,
    pub reproduction_artifact_ref: Option<String>,
    pub refutation_ref: Option<String>,
    pub supersedes: Option<DisputeId>,
}

impl Dispute {
    /// First round for a finding.
    pub fn open(finding_id: &str) -> Self {
        Self::at_round(finding_id, 1, None)
    }

    fn at_round(finding_id: &str, round: u32, supersedes: Option<DisputeId>) -> Self {
        Self {
            id: DisputeId::new(finding_id, round),
            subject_finding_id: finding_id.to_string(),
            round,
            opus_argument: None,
            codex_argument: None,
            verdict: None,
            reproduction_artifact_ref: None,
            refutation_ref: None,
            supersedes,
        }
    }

    /// The dispute that supersedes this one.
    pub fn next_round(&self) -> Dispute {
        Self::at_round(&self.subject_finding_id, self.round + 1, Some(self.id.clone()))
    }

    pub fn is_decided(&self) -> bool {
        self.verdict.is_some()
    }

    pub fn argument(&self, reviewer: Reviewer) -> Option<&ArtifactRef> {
        match reviewer {
            Reviewer::Opus => self.opus_argument.as_ref(),
            Reviewer::Codex => self.codex_argument.as_ref(),
        }
    }

    /// Artifact names used for this round's documents.
    pub fn argument_name(&self, reviewer: Reviewer) -> String {
        format!("{}.argument.{}", self.id, reviewer)
    }

    pub fn verdict_name(&self) -> String {
        format!("{}.verdict", self.id)
    }

    pub fn record_name(&self) -> String {
        format!("{}.record", self.id)
    }
}

/// What the orchestrator does next with a dispute.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Create the finding and continue downstream.
    Confirm {
        finding_id: String,
        reproduction_ref: String,
    },
    /// Drop the candidate and continue downstream.
    Disprove {
        finding_id: String,
        refutation_ref: String,
    },
    /// Write an added test, then run another round.
    Rerun { next: Dispute },
    /// Round budget spent; hand to an operator.
    Escalate {
        finding_id: String,
        round: u32,
        reason: String,
    },
    /// Inputs or evidence are not acceptable; the round must be redone.
    Incomplete(Decision),
}

impl Resolution {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Resolution::Confirm { .. } | Resolution::Disprove { .. } | Resolution::Escalate { .. }
        )
    }
}

/// Bounded dispute state machine.
#[derive(Debug, Clone, Copy)]
pub struct DisputeResolver {
    max_rounds: u32,
}

impl Default for DisputeResolver {
    fn default() -> Self {
        Self { max_rounds: 3 }
    }
}

impl DisputeResolver {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Both arguments must be declared as coming from their own isolated
    /// reviewer and must concern the disputed finding.
    pub fn check_isolation(&self, dispute: &Dispute, opus: &Artifact, codex: &Artifact) -> Decision {
        Decision::all([
            check_argument(dispute, Reviewer::Opus, opus),
            check_argument(dispute, Reviewer::Codex, codex),
        ])
    }

    /// Resolve a round from its stored arguments and verdict.
    pub fn resolve(
        &self,
        dispute: &mut Dispute,
        opus: &Artifact,
        codex: &Artifact,
        verdict: &Artifact,
    ) -> Resolution {
        let isolation = self.check_isolation(dispute, opus, codex);
        if !isolation.is_pass() {
            return Resolution::Incomplete(isolation);
        }
        let record = match verdict
            .json()
            .map(|doc| serde_json::from_value::<VerdictRecord>(doc.clone()))
        {
            Some(Ok(record)) => record,
            Some(Err(err)) => {
                return Resolution::Incomplete(Decision::block(
                    format!("{}: unreadable verdict: {}", verdict.reference(), err),
                    Vec::new(),
                ))
            }
            None => {
                return Resolution::Incomplete(Decision::block(
                    format!("{} is not a JSON verdict", verdict.reference()),
                    Vec::new(),
                ))
            }
        };
        dispute.opus_argument = Some(opus.reference());
        dispute.codex_argument = Some(codex.reference());
        self.resolve_record(dispute, &record)
    }

    /// Apply a verdict to a dispute round.
    pub fn resolve_record(&self, dispute: &mut Dispute, record: &VerdictRecord) -> Resolution {
        if record.finding_id != dispute.subject_finding_id {
            return Resolution::Incomplete(Decision::block(
                format!(
                    "verdict for {} attached to {}",
                    record.finding_id, dispute.id
                ),
                Vec::new(),
            ));
        }

        let resolution = match record.verdict {
            Verdict::Confirmed => match present(&record.reproduction_ref) {
                Some(reproduction) => {
                    dispute.reproduction_artifact_ref = Some(reproduction.to_string());
                    Resolution::Confirm {
                        finding_id: dispute.subject_finding_id.clone(),
                        reproduction_ref: reproduction.to_string(),
                    }
                }
                None => Resolution::Incomplete(Decision::block(
                    format!("{}: CONFIRMED without a reproduction artifact", dispute.id),
                    vec!["reproduction_ref".to_string()],
                )),
            },
            Verdict::Disproven => match present(&record.refutation_ref) {
                Some(refutation) => {
                    dispute.refutation_ref = Some(refutation.to_string());
                    Resolution::Disprove {
                        finding_id: dispute.subject_finding_id.clone(),
                        refutation_ref: refutation.to_string(),
                    }
                }
                None => Resolution::Incomplete(Decision::block(
                    format!("{}: DISPROVEN without refutation evidence", dispute.id),
                    vec!["refutation_ref".to_string()],
                )),
            },
            Verdict::Unclear if dispute.round >= self.max_rounds => Resolution::Escalate {
                finding_id: dispute.subject_finding_id.clone(),
                round: dispute.round,
                reason: format!(
                    "{} still UNCLEAR after {} of {} rounds",
                    dispute.subject_finding_id, dispute.round, self.max_rounds
                ),
            },
            Verdict::Unclear => Resolution::Rerun {
                next: dispute.next_round(),
            },
        };

        if !matches!(resolution, Resolution::Incomplete(_)) {
            dispute.verdict = Some(record.verdict);
        }
        tracing::info!(
            dispute = %dispute.id,
            round = dispute.round,
            verdict = %record.verdict,
            terminal = resolution.is_terminal(),
            "dispute resolved"
        );
        resolution
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn check_argument(dispute: &Dispute, reviewer: Reviewer, artifact: &Artifact) -> Decision {
    let reference = artifact.reference();
    let mut decision = Decision::Pass;
    if artifact.kind != ArtifactKind::DisputeArgument {
        decision = decision.merge(Decision::block(
            format!("{} argument {} is a {}", reviewer, reference, artifact.kind),
            Vec::new(),
        ));
    }
    if !artifact.has_category(reviewer.category()) {
        decision = decision.merge(Decision::block(
            format!(
                "{} argument {} does not declare category {}",
                reviewer,
                reference,
                reviewer.category()
            ),
            Vec::new(),
        ));
    }
    let other = reviewer.other().category();
    if artifact.has_category(other) {
        decision = decision.merge(Decision::block(
            format!(
                "{} argument {} carries {} content, isolation not declared",
                reviewer, reference, other
            ),
            Vec::new(),
        ));
    }
    let subject = artifact
        .json()
        .and_then(|doc| doc.get("finding_id"))
        .and_then(|id| id.as_str());
    if subject != Some(dispute.subject_finding_id.as_str()) {
        decision = decision.merge(Decision::block(
            format!(
                "{} argument {} is not about {}",
                reviewer, reference, dispute.subject_finding_id
            ),
            Vec::new(),
        ));
    }
    decision
}
