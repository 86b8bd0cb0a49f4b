//! Task node model for the review pipeline graph.
//!
//! Nodes are the atomic units of work the orchestrator claims and
//! dispatches. Each node tracks its lifecycle status, the stage or
//! internal operation it stands for, and free-form metadata.

use crate::blindness::BundleKind;
use crate::dispute::{DisputeId, Reviewer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier of a node within one run's graph.
///
/// Ids are handed out in creation order, so comparing two ids compares
/// when their nodes were created. This is what keeps `claim_next`
/// deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Position of this node in creation order.
    pub fn seq(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{:04}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s.strip_prefix("task-").unwrap_or(s);
        Ok(Self(digits.parse()?))
    }
}

/// Node status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Created, waiting for predecessors or a free slot.
    #[default]
    Pending,
    /// Claimed by the control loop.
    InProgress,
    /// Finished; dependents may proceed.
    Completed,
    /// Failed or held. Kept for audit; never reset in place.
    Blocked {
        /// Reason the node is blocked.
        reason: String,
    },
}

impl TaskStatus {
    /// Short label without the reason payload.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked { .. } => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// The fixed set of externally produced pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    ThreatModel,
    Invariants,
    SpecCompliance,
    ReviewOpus,
    ReviewCodex,
    Detection,
    ExploitReplay,
    VerifyFixes,
    Report,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::ThreatModel => "threat_model",
            StageKind::Invariants => "invariants",
            StageKind::SpecCompliance => "spec_compliance",
            StageKind::ReviewOpus => "review_opus",
            StageKind::ReviewCodex => "review_codex",
            StageKind::Detection => "detection",
            StageKind::ExploitReplay => "exploit_replay",
            StageKind::VerifyFixes => "verify_fixes",
            StageKind::Report => "report",
        }
    }

    pub fn all() -> [StageKind; 9] {
        [
            StageKind::ThreatModel,
            StageKind::Invariants,
            StageKind::SpecCompliance,
            StageKind::ReviewOpus,
            StageKind::ReviewCodex,
            StageKind::Detection,
            StageKind::ExploitReplay,
            StageKind::VerifyFixes,
            StageKind::Report,
        ]
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        StageKind::all()
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {}", s))
    }
}

/// What a node does when claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TaskKind {
    /// Dispatch a pipeline stage to the external producer.
    Stage { stage: StageKind },
    /// Materialize and audit a bundle for downstream consumers.
    Bundle { target: BundleKind },
    /// Merge review findings into the ledger and open disputes.
    Consolidate,
    /// Ask the producer to correct the artifacts of `origin`.
    Fix { origin: TaskId },
    /// Re-run the gate over the latest artifacts of `origin`.
    Revalidate { origin: TaskId },
    /// One side of an adversarial dispute round.
    DisputeReview { dispute: DisputeId, reviewer: Reviewer },
    /// Adjudicate the two arguments of a dispute round.
    DisputeResolve { dispute: DisputeId },
    /// Write a new test before an UNCLEAR dispute is rerun.
    AddedTest { dispute: DisputeId },
}

impl TaskKind {
    pub fn stage(stage: StageKind) -> Self {
        TaskKind::Stage { stage }
    }

    /// Kinds handled inside the control loop rather than by the producer.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            TaskKind::Bundle { .. } | TaskKind::Consolidate | TaskKind::Revalidate { .. }
        )
    }

    pub fn label(&self) -> String {
        match self {
            TaskKind::Stage { stage } => stage.to_string(),
            TaskKind::Bundle { target } => format!("bundle:{}", target),
            TaskKind::Consolidate => "consolidate".to_string(),
            TaskKind::Fix { origin } => format!("fix:{}", origin),
            TaskKind::Revalidate { origin } => format!("revalidate:{}", origin),
            TaskKind::DisputeReview { dispute, reviewer } => {
                format!("dispute_review:{}:{}", dispute, reviewer)
            }
            TaskKind::DisputeResolve { dispute } => format!("dispute_resolve:{}", dispute),
            TaskKind::AddedTest { dispute } => format!("added_test:{}", dispute),
        }
    }
}

/// Everything needed to create a node, minus the graph-assigned parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub title: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NodeSpec {
    pub fn new(title: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            title: title.into(),
            kind,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A node in the pipeline graph.
///
/// Only `TaskGraph` mutates nodes; everything else sees `&TaskNode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub title: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Predecessors that must be completed before this node may start.
    pub blocked_by: BTreeSet<TaskId>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    pub(crate) fn from_spec(id: TaskId, spec: NodeSpec, blocked_by: BTreeSet<TaskId>) -> Self {
        Self {
            id,
            title: spec.title,
            kind: spec.kind,
            status: TaskStatus::Pending,
            blocked_by,
            metadata: spec.metadata,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn complete(&mut self, metadata: BTreeMap<String, serde_json::Value>) {
        self.status = TaskStatus::Completed;
        self.metadata.extend(metadata);
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.status, TaskStatus::Blocked { .. })
    }

    /// Metadata lookup as a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}
