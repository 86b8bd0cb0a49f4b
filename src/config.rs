use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::StageKind;
use crate::coverage::CoveragePolicy;
use crate::{Error, Result};

fn default_max_rounds() -> u32 {
    3
}

fn default_max_fix_iterations() -> u32 {
    3
}

fn default_max_producer_retries() -> u32 {
    2
}

fn default_node_timeout_secs() -> u64 {
    1800
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_detection_passes() -> u32 {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Dispute rounds before an UNCLEAR finding escalates.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Fix/re-validate cycles per gated node.
    #[serde(default = "default_max_fix_iterations")]
    pub max_fix_iterations: u32,
    #[serde(default = "default_max_producer_retries")]
    pub max_producer_retries: u32,
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_detection_passes")]
    pub max_detection_passes: u32,
    /// Run directories, artifacts and the log file. Defaults to `~/.gatekeep`.
    pub state_dir: Option<String>,
    /// Coverage policy keyed by stage name.
    #[serde(default)]
    pub coverage: BTreeMap<String, CoveragePolicy>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            max_fix_iterations: default_max_fix_iterations(),
            max_producer_retries: default_max_producer_retries(),
            node_timeout_secs: default_node_timeout_secs(),
            max_parallel: default_max_parallel(),
            max_detection_passes: default_max_detection_passes(),
            state_dir: None,
            coverage: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn gatekeep_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".gatekeep"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::gatekeep_dir()?.join("gatekeep.toml"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::gatekeep_dir(),
        }
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    /// Policy for `stage`; stages without an entry warn at 0.0.
    pub fn coverage_policy(&self, stage: StageKind) -> CoveragePolicy {
        self.coverage
            .get(stage.as_str())
            .copied()
            .unwrap_or_default()
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_rounds = config.max_rounds,
            max_parallel = config.max_parallel,
            "config loaded"
        );
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&Self::config_path()?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(Error::Config("max_rounds must be at least 1".to_string()));
        }
        if self.max_parallel == 0 {
            return Err(Error::Config("max_parallel must be at least 1".to_string()));
        }
        if self.node_timeout_secs == 0 {
            return Err(Error::Config("node_timeout_secs must be positive".to_string()));
        }
        if self.max_detection_passes == 0 {
            return Err(Error::Config(
                "max_detection_passes must be at least 1".to_string(),
            ));
        }
        for (stage, policy) in &self.coverage {
            if stage.parse::<StageKind>().is_err() {
                return Err(Error::Config(format!("coverage policy for unknown stage {}", stage)));
            }
            if !(0.0..=1.0).contains(&policy.threshold) {
                return Err(Error::Config(format!(
                    "coverage threshold for {} must be within [0, 1], got {}",
                    stage, policy.threshold
                )));
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
