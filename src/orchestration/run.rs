//! Run records: metadata, graph snapshots and the final report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::RunId;
use crate::config::PipelineConfig;
use crate::core::graph::{GraphSnapshot, StatusCounts, TaskGraph};
use crate::core::task::{StageKind, TaskId, TaskKind};
use crate::coverage::{CoverageRecord, HintDirective};
use crate::dispute::Dispute;
use crate::finding::Finding;
use crate::util::write_atomic;
use crate::Result;

/// Run status; everything except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Blocked,
    Escalated,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Complete => write!(f, "complete"),
            RunStatus::Blocked => write!(f, "blocked"),
            RunStatus::Escalated => write!(f, "escalated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// A dispute stayed UNCLEAR through every round.
    Dispute,
    /// A producer kept failing after every retry.
    Producer,
}

/// Something handed to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub kind: EscalationKind,
    pub task: TaskId,
    pub subject: String,
    pub reason: String,
}

/// A node left blocked with no replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedNode {
    pub task: TaskId,
    pub title: String,
    pub reason: String,
}

/// Progress record read by external tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Status of the newest node for each stage.
    pub stages: BTreeMap<String, String>,
    pub counts: StatusCounts,
    pub config: PipelineConfig,
}

impl RunMetadata {
    pub fn capture(
        run_id: RunId,
        started_at: DateTime<Utc>,
        status: RunStatus,
        graph: &TaskGraph,
        config: &PipelineConfig,
    ) -> Self {
        let mut stages = BTreeMap::new();
        for node in graph.nodes() {
            if let TaskKind::Stage { stage } = node.kind {
                // Nodes come in creation order, so later nodes overwrite.
                stages.insert(stage.to_string(), node.status.label().to_string());
            }
        }
        for stage in StageKind::all() {
            stages
                .entry(stage.to_string())
                .or_insert_with(|| "absent".to_string());
        }
        Self {
            run_id,
            started_at,
            updated_at: Utc::now(),
            status,
            stages,
            counts: graph.counts(),
            config: config.clone(),
        }
    }
}

/// Final summary of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub findings: Vec<Finding>,
    pub disputes: Vec<Dispute>,
    pub escalations: Vec<Escalation>,
    pub blocked: Vec<BlockedNode>,
    pub coverage: CoverageRecord,
    pub hint_escalations: Vec<HintDirective>,
    pub counts: StatusCounts,
}

/// `<state_dir>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    dir: PathBuf,
}

impl RunDirectory {
    pub fn new(state_dir: &Path, run_id: RunId) -> Self {
        Self {
            dir: state_dir.join(run_id.to_string()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join("run.json")
    }

    pub fn graph_path(&self) -> PathBuf {
        self.dir.join("graph.json")
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join("report.json")
    }

    pub fn write_metadata(&self, metadata: &RunMetadata) -> Result<()> {
        write_atomic(&self.metadata_path(), &serde_json::to_string_pretty(metadata)?)
    }

    pub fn write_graph(&self, snapshot: &GraphSnapshot) -> Result<()> {
        write_atomic(&self.graph_path(), &serde_json::to_string_pretty(snapshot)?)
    }

    pub fn write_report(&self, report: &RunReport) -> Result<()> {
        write_atomic(&self.report_path(), &serde_json::to_string_pretty(report)?)
    }

    pub fn load_metadata(&self) -> Result<RunMetadata> {
        Ok(serde_json::from_str(&std::fs::read_to_string(
            self.metadata_path(),
        )?)?)
    }

    /// Rebuild the graph from its last snapshot.
    pub fn load_graph(&self) -> Result<TaskGraph> {
        let snapshot: GraphSnapshot =
            serde_json::from_str(&std::fs::read_to_string(self.graph_path())?)?;
        TaskGraph::from_snapshot(snapshot)
    }
}
