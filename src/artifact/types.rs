//! Artifact type definitions.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier for a pipeline run.
///
/// Every store and graph call carries one explicitly; there is no
/// process-wide "current run".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new unique run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Closed set of content labels controlling bundle inclusion.
///
/// Assigned from the producer's declared output, never inferred from
/// the content itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SpecProse,
    Code,
    InvariantList,
    PublicApi,
    ReviewOpus,
    ReviewCodex,
    TestResults,
    ThreatModel,
    Findings,
    Reproduction,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::SpecProse => "spec_prose",
            Category::Code => "code",
            Category::InvariantList => "invariant_list",
            Category::PublicApi => "public_api",
            Category::ReviewOpus => "review_opus",
            Category::ReviewCodex => "review_codex",
            Category::TestResults => "test_results",
            Category::ThreatModel => "threat_model",
            Category::Findings => "findings",
            Category::Reproduction => "reproduction",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared document kind; selects the gate validators that apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Caller-supplied input such as spec prose or source code.
    Source,
    ThreatModel,
    InvariantList,
    InvariantMapping,
    SpecComplianceReport,
    ReviewReport,
    CoverageRecord,
    DisputeArgument,
    DisputeVerdict,
    Dispute,
    FindingLedger,
    ReplayRecord,
    FindingUpdates,
    TestCase,
    BundleManifest,
    Report,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        f.write_str(json.as_str().unwrap_or("unknown"))
    }
}

/// Artifact body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "format", content = "body")]
pub enum ArtifactContent {
    Json(serde_json::Value),
    Text(String),
}

impl ArtifactContent {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ArtifactContent::Json(value) => Some(value),
            ArtifactContent::Text(_) => None,
        }
    }
}

impl From<serde_json::Value> for ArtifactContent {
    fn from(value: serde_json::Value) -> Self {
        ArtifactContent::Json(value)
    }
}

impl From<&str> for ArtifactContent {
    fn from(text: &str) -> Self {
        ArtifactContent::Text(text.to_string())
    }
}

/// Points at one immutable version of a named artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub version: u32,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// An artifact before the store assigns it a version.
///
/// This is also the shape producers hand back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub name: String,
    pub kind: ArtifactKind,
    pub content: ArtifactContent,
    pub categories: BTreeSet<Category>,
}

impl ArtifactDraft {
    pub fn new(
        name: impl Into<String>,
        kind: ArtifactKind,
        content: impl Into<ArtifactContent>,
        categories: &[Category],
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            content: content.into(),
            categories: categories.iter().copied().collect(),
        }
    }
}

/// A stored, immutable artifact version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub run_id: RunId,
    pub name: String,
    pub version: u32,
    pub kind: ArtifactKind,
    pub content: ArtifactContent,
    pub categories: BTreeSet<Category>,
    /// `None` for caller-supplied seed inputs.
    pub produced_by: Option<TaskId>,
    pub produced_at: DateTime<Utc>,
}

impl Artifact {
    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef::new(self.name.clone(), self.version)
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        self.content.as_json()
    }

    pub fn has_category(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }
}
