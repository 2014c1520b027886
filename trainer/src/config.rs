use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use splitnet::{AdamConfig, NetworkConfig, SplitConfig};

use crate::experiments::tasks::WorkloadConfig;

/// Everything a training run needs. Loaded from JSON, then overridden by
/// command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub name: String,
    pub seed: u64,
    pub num_updates: u64,
    /// Rows sampled per task per update.
    pub batch_size: usize,
    pub print_freq: u64,
    pub checkpoint_dir: Option<PathBuf>,
    /// Updates between checkpoints; 0 saves only at the end.
    pub checkpoint_freq: u64,
    pub network: NetworkConfig,
    pub split: SplitConfig,
    pub adam: AdamConfig,
    pub workload: WorkloadConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            name: "splitnet".into(),
            seed: 1,
            num_updates: 2000,
            batch_size: 16,
            print_freq: 100,
            checkpoint_dir: None,
            checkpoint_freq: 0,
            network: NetworkConfig::default(),
            split: SplitConfig::default(),
            adam: AdamConfig { lr: 3e-3, ..AdamConfig::default() },
            workload: WorkloadConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: TrainConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            bail!("run name must be a non-empty single path component, got {:?}", self.name);
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        self.network.validate().context("network config")?;
        self.split.validate().context("split config")?;
        self.adam.validate().context("adam config")?;
        self.workload.validate(&self.network).context("workload config")?;
        Ok(())
    }

    /// `<checkpoint_dir>/<name>/latest.json`, if checkpointing is enabled.
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.checkpoint_dir
            .as_ref()
            .map(|dir| dir.join(&self.name).join("latest.json"))
    }
}
