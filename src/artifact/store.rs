//! Versioned artifact store with optional file backing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::types::{Artifact, ArtifactDraft, ArtifactRef, RunId};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::util::write_atomic;

/// Append-only map from `(run, name)` to artifact versions.
///
/// Writing an existing name adds a new version; earlier versions are
/// never changed, so any past gate decision can be reproduced against
/// the exact content it saw.
///
/// When opened on a directory, every version is also written to
/// `<root>/<run_id>/artifacts/<name>.v<version>.json`.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    root: Option<PathBuf>,
    artifacts: BTreeMap<(RunId, String), Vec<Artifact>>,
}

impl ArtifactStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a file-backed store, loading every artifact already under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let mut store = Self {
            root: Some(root.to_path_buf()),
            artifacts: BTreeMap::new(),
        };
        if !root.exists() {
            fs::create_dir_all(root)?;
            return Ok(store);
        }

        for run_entry in fs::read_dir(root)? {
            let dir = run_entry?.path().join("artifacts");
            if !dir.is_dir() {
                continue;
            }
            for file in fs::read_dir(&dir)? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let artifact: Artifact = serde_json::from_str(&fs::read_to_string(&path)?)?;
                store
                    .artifacts
                    .entry((artifact.run_id, artifact.name.clone()))
                    .or_default()
                    .push(artifact);
            }
        }
        for versions in store.artifacts.values_mut() {
            versions.sort_by_key(|a| a.version);
        }
        tracing::debug!(root = %root.display(), names = store.artifacts.len(), "artifact store opened");
        Ok(store)
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Store a new version of `draft.name` and return its reference.
    pub fn put(
        &mut self,
        run_id: RunId,
        draft: ArtifactDraft,
        produced_by: Option<TaskId>,
    ) -> Result<ArtifactRef> {
        check_name(&draft.name)?;
        let key = (run_id, draft.name.clone());
        let version = self
            .artifacts
            .get(&key)
            .and_then(|versions| versions.last())
            .map(|latest| latest.version + 1)
            .unwrap_or(1);

        let artifact = Artifact {
            run_id,
            name: draft.name,
            version,
            kind: draft.kind,
            content: draft.content,
            categories: draft.categories,
            produced_by,
            produced_at: Utc::now(),
        };

        if let Some(root) = &self.root {
            write_artifact(root, &artifact)?;
        }

        let reference = artifact.reference();
        tracing::debug!(
            run_id = %run_id,
            artifact = %reference,
            kind = %artifact.kind,
            "artifact stored"
        );
        self.artifacts.entry(key).or_default().push(artifact);
        Ok(reference)
    }

    /// Latest version of `name`.
    pub fn get(&self, run_id: RunId, name: &str) -> Result<&Artifact> {
        self.artifacts
            .get(&(run_id, name.to_string()))
            .and_then(|versions| versions.last())
            .ok_or_else(|| not_found(run_id, name))
    }

    /// The exact version a reference points at.
    pub fn get_ref(&self, run_id: RunId, reference: &ArtifactRef) -> Result<&Artifact> {
        self.artifacts
            .get(&(run_id, reference.name.clone()))
            .and_then(|versions| versions.iter().find(|a| a.version == reference.version))
            .ok_or_else(|| not_found(run_id, &reference.to_string()))
    }

    pub fn exists(&self, run_id: RunId, name: &str) -> bool {
        self.artifacts.contains_key(&(run_id, name.to_string()))
    }

    /// Every version of `name`, oldest first.
    pub fn versions(&self, run_id: RunId, name: &str) -> &[Artifact] {
        self.artifacts
            .get(&(run_id, name.to_string()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// The latest version of every artifact in a run, ordered by name.
    pub fn latest_all(&self, run_id: RunId) -> Vec<&Artifact> {
        self.artifacts
            .range((run_id, String::new())..)
            .take_while(|((run, _), _)| *run == run_id)
            .filter_map(|(_, versions)| versions.last())
            .collect()
    }

    pub fn len(&self, run_id: RunId) -> usize {
        self.latest_all(run_id).len()
    }
}

fn not_found(run_id: RunId, name: &str) -> Error {
    Error::ArtifactNotFound {
        run_id: run_id.to_string(),
        name: name.to_string(),
    }
}

/// Names become file stems, so they are limited to a path-safe alphabet.
fn check_name(name: &str) -> Result<()> {
    let safe = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if name.is_empty() || !safe || name.starts_with('.') {
        return Err(Error::InvariantViolation(format!(
            "invalid artifact name {:?}",
            name
        )));
    }
    Ok(())
}

fn write_artifact(root: &Path, artifact: &Artifact) -> Result<()> {
    let dir = root.join(artifact.run_id.to_string()).join("artifacts");
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.v{}.json", artifact.name, artifact.version));
    if path.exists() {
        return Err(Error::InvariantViolation(format!(
            "artifact {} already written",
            artifact.reference()
        )));
    }
    write_atomic(&path, &serde_json::to_string_pretty(artifact)?)
}
