//! # Engine Configuration

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

/// What a chain fold does when an operation cannot be constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Propagate `ConstructionFailed` and stop the fold
    #[default]
    Abort,
    /// Pass the running image through and continue
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Intermediate chain outputs kept for prefix resume (0 disables)
    pub output_cache_capacity: usize,
    /// Idle, unlocked instances kept warm before LRU reclamation
    pub max_idle_instances: Option<usize>,
    /// Images whose detected regions are remembered
    pub region_memo_capacity: usize,
    /// Preset intensities within this of 0 or 1 count as 0 or 1
    pub intensity_epsilon: f32,
    pub on_construction_failure: FailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_cache_capacity: 32,
            max_idle_instances: None,
            region_memo_capacity: 4,
            intensity_epsilon: 0.01,
            on_construction_failure: FailurePolicy::Abort,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| FilterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parsing engine config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..0.5).contains(&self.intensity_epsilon) {
            return Err(FilterError::Config(format!(
                "intensity_epsilon {} must be in [0, 0.5)",
                self.intensity_epsilon
            )));
        }
        Ok(())
    }
}
