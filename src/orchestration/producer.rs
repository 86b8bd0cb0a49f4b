//! Boundary to the external collaborators that do the actual review work.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactDraft, RunId};
use crate::core::task::{TaskId, TaskKind};
use crate::coverage::HintDirective;
use crate::Result;

/// Everything a producer gets for one node.
///
/// `inputs` is already filtered: for bundle-gated consumers it holds only
/// the bundle's artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub run_id: RunId,
    pub task: TaskId,
    pub title: String,
    pub kind: TaskKind,
    /// For fix nodes, the kind of the node whose artifacts are corrected.
    pub origin: Option<TaskKind>,
    pub inputs: Vec<Artifact>,
    /// Block reason a fix node is asked to address.
    pub feedback: Option<String>,
    /// Set on detection passes that follow a stalled one.
    pub hint: Option<HintDirective>,
    /// 0 for the first attempt, incremented on every retry node.
    pub attempt: u32,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ProduceRequest {
    pub fn input(&self, name: &str) -> Option<&Artifact> {
        self.inputs.iter().find(|a| a.name == name)
    }

    /// The kind whose outputs are expected: `origin` for fix nodes.
    pub fn target_kind(&self) -> &TaskKind {
        self.origin.as_ref().unwrap_or(&self.kind)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Artifacts returned by a producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerOutput {
    pub artifacts: Vec<ArtifactDraft>,
}

impl ProducerOutput {
    pub fn new(artifacts: Vec<ArtifactDraft>) -> Self {
        Self { artifacts }
    }

    pub fn single(artifact: ArtifactDraft) -> Self {
        Self {
            artifacts: vec![artifact],
        }
    }
}

/// An external stage implementation.
///
/// Any error is treated as a node failure and answered with an explicit
/// retry node; the producer itself should not retry.
pub trait Producer: Send + Sync {
    fn produce(&self, request: ProduceRequest) -> BoxFuture<'_, Result<ProducerOutput>>;
}
