//! Coverage accounting and the hint escalation ladder.

use serde::{Deserialize, Serialize};

use crate::artifact::RunId;
use crate::gate::Decision;

/// How specific the guidance to a stalled detector is.
///
/// Ordered: `None < Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum HintLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl HintLevel {
    pub fn next(&self) -> Option<HintLevel> {
        match self {
            HintLevel::None => Some(HintLevel::Low),
            HintLevel::Low => Some(HintLevel::Medium),
            HintLevel::Medium => Some(HintLevel::High),
            HintLevel::High => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HintLevel::None => "none",
            HintLevel::Low => "low",
            HintLevel::Medium => "medium",
            HintLevel::High => "high",
        }
    }
}

impl std::fmt::Display for HintLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted coverage record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub entrypoints_total: u64,
    pub entrypoints_reviewed: u64,
    pub high_med_candidates: u64,
    pub validated_high_med: u64,
    pub hint_level: HintLevel,
}

impl CoverageRecord {
    pub fn ratio(&self) -> f64 {
        coverage_ratio(self.entrypoints_reviewed, self.entrypoints_total)
    }
}

/// `reviewed / total`, or 0 when nothing is known yet.
pub fn coverage_ratio(reviewed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        reviewed as f64 / total as f64
    }
}

/// Instruction to run the next detection pass at a higher hint level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintDirective {
    pub level: HintLevel,
    pub previous: HintLevel,
    pub reason: String,
}

/// Result of closing one detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub pass: u32,
    pub new_validated: u64,
    /// Set when the pass stalled and the level went up.
    pub directive: Option<HintDirective>,
    /// The pass stalled at `high`, so there is nowhere left to go.
    pub exhausted: bool,
}

impl PassOutcome {
    pub fn stalled(&self) -> bool {
        self.new_validated == 0
    }
}

/// Running coverage counts for one run.
#[derive(Debug, Clone)]
pub struct CoverageTracker {
    run_id: RunId,
    record: CoverageRecord,
    passes: u32,
    validated_at_last_pass: u64,
    escalations: Vec<HintDirective>,
}

impl CoverageTracker {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            record: CoverageRecord::default(),
            passes: 0,
            validated_at_last_pass: 0,
            escalations: Vec::new(),
        }
    }

    pub fn record(&self) -> CoverageRecord {
        self.record
    }

    pub fn ratio(&self) -> f64 {
        self.record.ratio()
    }

    pub fn hint_level(&self) -> HintLevel {
        self.record.hint_level
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn escalations(&self) -> &[HintDirective] {
        &self.escalations
    }

    /// Fold in counts reported by a stage.
    ///
    /// Counts only grow: each field keeps the larger of the current and
    /// reported value. The hint level in `reported` is ignored; only the
    /// tracker moves it.
    pub fn absorb(&mut self, reported: &CoverageRecord) {
        let r = &mut self.record;
        r.entrypoints_total = r.entrypoints_total.max(reported.entrypoints_total);
        r.entrypoints_reviewed = r.entrypoints_reviewed.max(reported.entrypoints_reviewed);
        r.high_med_candidates = r.high_med_candidates.max(reported.high_med_candidates);
        r.validated_high_med = r.validated_high_med.max(reported.validated_high_med);
    }

    pub fn add_candidates(&mut self, n: u64) {
        self.record.high_med_candidates += n;
    }

    pub fn add_validated(&mut self, n: u64) {
        self.record.validated_high_med += n;
        self.record.high_med_candidates = self
            .record
            .high_med_candidates
            .max(self.record.validated_high_med);
    }

    /// Close a detection pass, escalating the hint level when it added no
    /// validated HIGH/MED findings.
    pub fn finish_pass(&mut self) -> PassOutcome {
        self.passes += 1;
        let new_validated = self
            .record
            .validated_high_med
            .saturating_sub(self.validated_at_last_pass);
        self.validated_at_last_pass = self.record.validated_high_med;

        if new_validated > 0 {
            tracing::debug!(
                run_id = %self.run_id.short(),
                pass = self.passes,
                new_validated,
                "detection pass made progress"
            );
            return PassOutcome {
                pass: self.passes,
                new_validated,
                directive: None,
                exhausted: false,
            };
        }

        let previous = self.record.hint_level;
        let Some(level) = previous.next() else {
            tracing::warn!(
                run_id = %self.run_id.short(),
                pass = self.passes,
                "detection stalled at highest hint level"
            );
            return PassOutcome {
                pass: self.passes,
                new_validated,
                directive: None,
                exhausted: true,
            };
        };

        self.record.hint_level = level;
        let directive = HintDirective {
            level,
            previous,
            reason: format!(
                "detection pass {} added no validated HIGH/MED findings at hint level {}",
                self.passes, previous
            ),
        };
        tracing::info!(
            run_id = %self.run_id.short(),
            pass = self.passes,
            from = %previous,
            to = %level,
            "hint level escalated"
        );
        self.escalations.push(directive.clone());
        PassOutcome {
            pass: self.passes,
            new_validated,
            directive: Some(directive),
            exhausted: false,
        }
    }
}

/// What to do when a stage's coverage is under its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoverageAction {
    #[default]
    Warn,
    Block,
}

/// One enforcement level per stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CoveragePolicy {
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub action: CoverageAction,
}

impl CoveragePolicy {
    pub fn block_below(threshold: f64) -> Self {
        Self {
            threshold,
            action: CoverageAction::Block,
        }
    }

    /// Apply the policy to a coverage ratio. A warning is logged and
    /// passes; only `block` can stop the stage.
    pub fn check(&self, stage: &str, ratio: f64) -> Decision {
        if ratio >= self.threshold {
            return Decision::Pass;
        }
        let reason = format!(
            "{} coverage {:.2} is below threshold {:.2}",
            stage, ratio, self.threshold
        );
        match self.action {
            CoverageAction::Warn => {
                tracing::warn!(stage, ratio, threshold = self.threshold, "coverage below threshold");
                Decision::Pass
            }
            CoverageAction::Block => Decision::block(reason, vec![format!("{} coverage", stage)]),
        }
    }
}
