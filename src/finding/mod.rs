//! Findings and the consolidation ledger.
//!
//! Review stages report candidate issues. Consolidation merges candidates
//! that describe the same issue (by similarity key) so each one is
//! disputed and tracked once. A candidate becomes a `Finding` when a
//! dispute confirms it, or directly at consolidation for LOW/INFO
//! severities, which are not disputed.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    High,
    Med,
    Low,
    Info,
}

impl Severity {
    /// Higher is more severe.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::High => 3,
            Severity::Med => 2,
            Severity::Low => 1,
            Severity::Info => 0,
        }
    }

    /// HIGH and MED findings go through adversarial dispute.
    pub fn is_high_or_med(&self) -> bool {
        matches!(self, Severity::High | Severity::Med)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Some(Severity::High),
            "MED" | "MEDIUM" => Some(Severity::Med),
            "LOW" => Some(Severity::Low),
            "INFO" => Some(Severity::Info),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::High => write!(f, "HIGH"),
            Severity::Med => write!(f, "MED"),
            Severity::Low => write!(f, "LOW"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingStatus {
    #[default]
    Open,
    FixedPendingVerify,
    Closed,
}

impl std::fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingStatus::Open => write!(f, "OPEN"),
            FindingStatus::FixedPendingVerify => write!(f, "FIXED_PENDING_VERIFY"),
            FindingStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A tracked issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    pub status: FindingStatus,
    #[serde(default)]
    pub regression_test_ref: Option<String>,
    #[serde(default)]
    pub verifier_confirmed: bool,
    /// Reproduction that confirmed the finding in dispute.
    #[serde(default)]
    pub reproduction_ref: Option<String>,
    #[serde(default)]
    pub sources: BTreeSet<String>,
}

/// What is still missing before a finding may be `CLOSED`.
pub fn closure_gaps(
    finding_id: &str,
    regression_test_ref: Option<&str>,
    verifier_confirmed: bool,
) -> Vec<String> {
    let mut gaps = Vec::new();
    if regression_test_ref.map_or(true, |r| r.trim().is_empty()) {
        gaps.push(format!("{} regression_test_ref", finding_id));
    }
    if !verifier_confirmed {
        gaps.push(format!("{} verifier confirmation", finding_id));
    }
    gaps
}

/// Reject a closed finding that lacks a regression test or verifier
/// confirmation.
pub fn check_closure(finding: &Finding) -> Result<()> {
    if finding.status != FindingStatus::Closed {
        return Ok(());
    }
    let gaps = closure_gaps(
        &finding.id,
        finding.regression_test_ref.as_deref(),
        finding.verifier_confirmed,
    );
    if gaps.is_empty() {
        Ok(())
    } else {
        Err(Error::InvariantViolation(format!(
            "finding {} is CLOSED without {}",
            finding.id,
            gaps.join(" and ")
        )))
    }
}

/// A status change requested by the fix-verification loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingUpdate {
    pub finding_id: String,
    pub status: FindingStatus,
    #[serde(default)]
    pub regression_test_ref: Option<String>,
    #[serde(default)]
    pub verifier_confirmed: bool,
}

/// A candidate issue as reported by one review stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInput {
    pub title: String,
    pub severity: Severity,
    #[serde(default)]
    pub location: Option<String>,
}

impl CandidateInput {
    pub fn new(title: &str, severity: Severity, location: Option<&str>) -> Self {
        Self {
            title: title.to_string(),
            severity,
            location: location.map(str::to_string),
        }
    }
}

/// Merged candidate awaiting a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub key: String,
    pub title: String,
    pub severity: Severity,
    #[serde(default)]
    pub location: Option<String>,
    pub sources: BTreeSet<String>,
}

fn non_alnum() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"))
}

fn line_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(:\d+)+$").expect("valid regex"))
}

/// Key under which two candidates count as the same issue: normalised
/// title plus location without line numbers.
pub fn similarity_key(title: &str, location: Option<&str>) -> String {
    let title = non_alnum()
        .replace_all(&title.to_lowercase(), " ")
        .trim()
        .to_string();
    let location = location
        .map(|l| line_suffix().replace(l.trim(), "").to_lowercase())
        .unwrap_or_default();
    format!("{}|{}", title, location)
}

/// Result of one consolidation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationSummary {
    /// Candidates seen for the first time.
    pub new: Vec<String>,
    /// Count of inputs folded into an existing candidate.
    pub merged: usize,
    /// LOW/INFO candidates recorded as findings without dispute.
    pub recorded: Vec<String>,
}

/// All candidates and findings of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindingLedger {
    candidates: BTreeMap<String, Candidate>,
    findings: BTreeMap<String, Finding>,
    by_key: BTreeMap<String, String>,
    next_seq: u32,
}

impl FindingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge candidates from several review stages.
    pub fn consolidate<I>(&mut self, reports: I) -> ConsolidationSummary
    where
        I: IntoIterator<Item = (String, Vec<CandidateInput>)>,
    {
        let mut summary = ConsolidationSummary::default();
        for (source, inputs) in reports {
            for input in inputs {
                let key = similarity_key(&input.title, input.location.as_deref());
                if let Some(id) = self.by_key.get(&key) {
                    if let Some(existing) = self.candidates.get_mut(id) {
                        if input.severity.rank() > existing.severity.rank() {
                            existing.severity = input.severity;
                        }
                        existing.sources.insert(source.clone());
                        summary.merged += 1;
                    }
                    continue;
                }
                self.next_seq += 1;
                let id = format!("F-{:03}", self.next_seq);
                self.by_key.insert(key.clone(), id.clone());
                self.candidates.insert(
                    id.clone(),
                    Candidate {
                        id: id.clone(),
                        key,
                        title: input.title,
                        severity: input.severity,
                        location: input.location,
                        sources: [source.clone()].into_iter().collect(),
                    },
                );
                summary.new.push(id);
            }
        }

        // Severity is final only after every report has been merged.
        for id in &summary.new {
            let Some(candidate) = self.candidates.get(id) else {
                continue;
            };
            if !candidate.severity.is_high_or_med() {
                let finding = finding_from(candidate, None);
                self.findings.insert(id.clone(), finding);
                summary.recorded.push(id.clone());
            }
        }
        tracing::debug!(
            new = summary.new.len(),
            merged = summary.merged,
            recorded = summary.recorded.len(),
            "findings consolidated"
        );
        summary
    }

    pub fn candidate(&self, id: &str) -> Option<&Candidate> {
        self.candidates.get(id)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    /// HIGH/MED candidates among `ids` that still need a dispute.
    pub fn disputable<'a>(&'a self, ids: &'a [String]) -> impl Iterator<Item = &'a Candidate> {
        ids.iter()
            .filter_map(|id| self.candidates.get(id))
            .filter(|c| c.severity.is_high_or_med() && !self.findings.contains_key(&c.id))
    }

    /// Promote a confirmed candidate into an open finding.
    pub fn confirm(&mut self, candidate_id: &str, reproduction_ref: &str) -> Result<&Finding> {
        let candidate = self.candidates.get(candidate_id).ok_or_else(|| {
            Error::InvariantViolation(format!("unknown finding candidate {}", candidate_id))
        })?;
        if !candidate.severity.is_high_or_med() {
            return Err(Error::InvariantViolation(format!(
                "candidate {} is {}, only HIGH/MED findings are confirmed by dispute",
                candidate_id, candidate.severity
            )));
        }
        let finding = finding_from(candidate, Some(reproduction_ref));
        Ok(self.findings.entry(candidate_id.to_string()).or_insert(finding))
    }

    pub fn get(&self, id: &str) -> Option<&Finding> {
        self.findings.get(id)
    }

    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.values()
    }

    /// Ids of findings confirmed by a reproduction.
    pub fn confirmed_ids(&self) -> Vec<String> {
        self.findings
            .values()
            .filter(|f| f.reproduction_ref.is_some())
            .map(|f| f.id.clone())
            .collect()
    }

    /// Apply a status transition, enforcing the closure check.
    pub fn apply(&mut self, update: &FindingUpdate) -> Result<()> {
        let finding = self.findings.get(&update.finding_id).ok_or_else(|| {
            Error::InvariantViolation(format!("unknown finding {}", update.finding_id))
        })?;

        use FindingStatus::*;
        let allowed = matches!(
            (finding.status, update.status),
            (Open, FixedPendingVerify)
                | (FixedPendingVerify, Closed)
                | (FixedPendingVerify, Open)
                | (Closed, Open)
        ) || finding.status == update.status;
        if !allowed {
            return Err(Error::InvariantViolation(format!(
                "finding {} cannot move from {} to {}",
                finding.id, finding.status, update.status
            )));
        }

        let mut next = finding.clone();
        next.status = update.status;
        if update.regression_test_ref.is_some() {
            next.regression_test_ref = update.regression_test_ref.clone();
        }
        next.verifier_confirmed = update.status == Closed && update.verifier_confirmed;
        check_closure(&next)?;

        tracing::debug!(finding = %next.id, status = %next.status, "finding updated");
        self.findings.insert(next.id.clone(), next);
        Ok(())
    }

    /// Insert a finding as-is, subject to the closure check.
    pub fn insert(&mut self, finding: Finding) -> Result<()> {
        check_closure(&finding)?;
        self.findings.insert(finding.id.clone(), finding);
        Ok(())
    }

    /// Check every finding before the ledger is persisted.
    pub fn verify(&self) -> Result<()> {
        self.findings.values().try_for_each(check_closure)
    }

    /// Serialized form stored as the `finding_ledger` artifact.
    pub fn to_document(&self) -> Result<serde_json::Value> {
        self.verify()?;
        Ok(serde_json::json!({
            "candidates": self.candidates.values().collect::<Vec<_>>(),
            "findings": self.findings.values().collect::<Vec<_>>(),
            "confirmed": self.confirmed_ids(),
        }))
    }
}

fn finding_from(candidate: &Candidate, reproduction_ref: Option<&str>) -> Finding {
    Finding {
        id: candidate.id.clone(),
        severity: candidate.severity,
        title: candidate.title.clone(),
        location: candidate.location.clone(),
        status: FindingStatus::Open,
        regression_test_ref: None,
        verifier_confirmed: false,
        reproduction_ref: reproduction_ref.map(str::to_string),
        sources: candidate.sources.clone(),
    }
}

/// Parse the `findings` array of a review report into candidates.
///
/// Entries with an unknown severity are skipped; the gate has already
/// rejected reports where that matters.
pub fn candidates_from_report(doc: &serde_json::Value) -> Vec<CandidateInput> {
    doc.get("findings")
        .and_then(|f| f.as_array())
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let title = entry.get("title")?.as_str()?;
            let severity = Severity::parse(entry.get("severity")?.as_str()?)?;
            let location = entry.get("location").and_then(|l| l.as_str());
            Some(CandidateInput::new(title, severity, location))
        })
        .collect()
}
