//! Built-in validators for the pipeline's artifact kinds.

use std::collections::BTreeSet;

use serde_json::Value;

use super::rules::lookup;
use super::{Decision, GateInput, RuleSet, Validator};
use crate::artifact::ArtifactKind;
use crate::finding::closure_gaps;

pub const HINT_LEVELS: &[&str] = &["none", "low", "medium", "high"];
pub const SEVERITIES: &[&str] = &["HIGH", "MED", "LOW", "INFO"];
pub const VERDICTS: &[&str] = &["CONFIRMED", "DISPROVEN", "UNCLEAR"];
pub const FINDING_STATUSES: &[&str] = &["OPEN", "FIXED_PENDING_VERIFY", "CLOSED"];

const COVERAGE_COUNTS: &[&str] = &[
    "entrypoints_total",
    "entrypoints_reviewed",
    "high_med_candidates",
    "validated_high_med",
];

pub fn coverage_record() -> RuleSet {
    RuleSet::new("coverage_record")
        .require(COVERAGE_COUNTS)
        .require(&["hint_level"])
        .non_negative(COVERAGE_COUNTS)
        .one_of("hint_level", HINT_LEVELS)
        .not_greater("entrypoints_reviewed", "entrypoints_total")
        .not_greater("validated_high_med", "high_med_candidates")
}

pub fn threat_model() -> RuleSet {
    RuleSet::new("threat_model").require(&["assets", "entrypoints"])
}

pub fn invariant_list() -> RuleSet {
    RuleSet::new("invariant_list")
        .require(&["invariants"])
        .each_require("invariants", &["id"])
}

pub fn spec_compliance_report() -> RuleSet {
    RuleSet::new("spec_compliance_report")
        .require(&["items"])
        .each_require("items", &["invariant_id", "status"])
        .each_one_of("items", "status", &["compliant", "violated", "unclear"])
}

pub fn review_report() -> RuleSet {
    RuleSet::new("review_report")
        .require(&["findings"])
        .each_require("findings", &["id", "title", "severity"])
        .each_one_of("findings", "severity", SEVERITIES)
}

pub fn dispute_argument() -> RuleSet {
    RuleSet::new("dispute_argument")
        .require(&["finding_id", "position", "argument"])
        .one_of("position", &["exploitable", "not_exploitable", "uncertain"])
}

pub fn dispute_verdict() -> RuleSet {
    RuleSet::new("dispute_verdict")
        .require(&["finding_id", "verdict"])
        .one_of("verdict", VERDICTS)
        .require_when("verdict", "CONFIRMED", "reproduction_ref")
        .require_when("verdict", "DISPROVEN", "refutation_ref")
}

pub fn test_case() -> RuleSet {
    RuleSet::new("test_case").require(&["test_id", "target_finding"])
}

pub fn report() -> RuleSet {
    RuleSet::new("report").require(&["summary"])
}

fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => value.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn invariant_ids(doc: &Value) -> Option<Vec<String>> {
    lookup(doc, "invariants")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(id_of).collect())
}

/// Every invariant must map to at least one test.
///
/// Invariant ids are the union of the mapping's own `invariants` list and
/// a related `invariant_list` artifact, so the mapping cannot narrow the
/// set it is checked against.
pub struct InvariantMappingValidator;

impl Validator for InvariantMappingValidator {
    fn name(&self) -> &str {
        "invariant_mapping"
    }

    fn validate(&self, input: &GateInput<'_>) -> Decision {
        let Some(doc) = input.artifact.json() else {
            return Decision::block("invariant_mapping: not a JSON document", Vec::new());
        };

        let own = invariant_ids(doc);
        let listed = input
            .related_of_kind(ArtifactKind::InvariantList)
            .and_then(|list| list.json())
            .and_then(invariant_ids);
        let invariants = match (own, listed) {
            (Some(mut ids), Some(listed)) => {
                for id in listed {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Some(ids)
            }
            (own, listed) => own.or(listed),
        };
        let Some(invariants) = invariants else {
            return Decision::block(
                "invariant_mapping: no invariant list to check against",
                vec!["invariants".to_string()],
            );
        };

        let mut mapped = BTreeSet::new();
        let mut unknown = Vec::new();
        for row in lookup(doc, "mappings")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(id) = row.get("invariant_id").and_then(Value::as_str) else {
                continue;
            };
            let has_test = row
                .get("test")
                .and_then(Value::as_str)
                .is_some_and(|t| !t.trim().is_empty());
            if !invariants.iter().any(|i| i == id) {
                unknown.push(id.to_string());
            } else if has_test {
                mapped.insert(id.to_string());
            }
        }

        let missing: Vec<String> = invariants
            .iter()
            .filter(|id| !mapped.contains(id.as_str()))
            .map(|id| format!("{}→test mapping", id))
            .collect();

        let mut decision = Decision::Pass;
        if !missing.is_empty() {
            let ids: Vec<&str> = missing
                .iter()
                .map(|m| m.trim_end_matches("→test mapping"))
                .collect();
            decision = decision.merge(Decision::block(
                format!("invariant_mapping: no test maps invariant {}", ids.join(", ")),
                missing,
            ));
        }
        if !unknown.is_empty() {
            decision = decision.merge(Decision::block(
                format!("invariant_mapping: unknown invariant {}", unknown.join(", ")),
                Vec::new(),
            ));
        }
        decision
    }
}

/// Exploit replay must cover each confirmed finding exactly once.
pub struct ReplayRecordValidator;

impl Validator for ReplayRecordValidator {
    fn name(&self) -> &str {
        "replay_record"
    }

    fn validate(&self, input: &GateInput<'_>) -> Decision {
        let Some(doc) = input.artifact.json() else {
            return Decision::block("replay_record: not a JSON document", Vec::new());
        };
        let shape = RuleSet::new("replay_record")
            .require(&["entries"])
            .each_require("entries", &["finding_id"])
            .check(doc);
        if !shape.is_pass() {
            return shape;
        }

        let mut seen = BTreeSet::new();
        let mut decision = Decision::Pass;
        for (i, entry) in lookup(doc, "entries")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
        {
            let id = entry
                .get("finding_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if entry.get("verdict").is_none() && entry.get("status").is_none() {
                decision = decision.merge(Decision::block(
                    format!("replay_record: entry {} for {} has no outcome", i, id),
                    vec![format!("entries[{}].verdict", id)],
                ));
            }
            if !seen.insert(id.clone()) {
                decision = decision.merge(Decision::block(
                    format!("replay_record: duplicate entry for {}", id),
                    Vec::new(),
                ));
            }
        }

        let confirmed: Vec<String> = input
            .related_of_kind(ArtifactKind::FindingLedger)
            .and_then(|ledger| ledger.json())
            .and_then(|ledger| ledger.get("confirmed"))
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let absent: Vec<String> = confirmed
            .iter()
            .filter(|id| !seen.contains(id.as_str()))
            .map(|id| format!("replay entry for {}", id))
            .collect();
        if !absent.is_empty() {
            decision = decision.merge(Decision::block(
                format!(
                    "replay_record: {} confirmed finding(s) not replayed",
                    absent.len()
                ),
                absent,
            ));
        }
        decision
    }
}

/// Status transitions from fix verification; `CLOSED` needs a
/// regression test and verifier confirmation.
pub struct FindingUpdatesValidator;

impl Validator for FindingUpdatesValidator {
    fn name(&self) -> &str {
        "finding_updates"
    }

    fn validate(&self, input: &GateInput<'_>) -> Decision {
        let Some(doc) = input.artifact.json() else {
            return Decision::block("finding_updates: not a JSON document", Vec::new());
        };
        let shape = RuleSet::new("finding_updates")
            .require(&["updates"])
            .each_require("updates", &["finding_id", "status"])
            .each_one_of("updates", "status", FINDING_STATUSES)
            .check(doc);
        if !shape.is_pass() {
            return shape;
        }

        let mut gaps = Vec::new();
        for update in lookup(doc, "updates")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if update.get("status").and_then(Value::as_str) != Some("CLOSED") {
                continue;
            }
            let id = update
                .get("finding_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            gaps.extend(closure_gaps(
                id,
                update.get("regression_test_ref").and_then(Value::as_str),
                update
                    .get("verifier_confirmed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            ));
        }
        if gaps.is_empty() {
            Decision::Pass
        } else {
            Decision::block(
                format!("finding_updates: closure requirements unmet ({})", gaps.join(", ")),
                gaps,
            )
        }
    }
}
