//! JSON snapshots of a training run: network, split statistics and optimizer.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitError};
use crate::network::SplittingNetwork;
use crate::optim::Adam;
use crate::stats::SplitStatistics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub saved_at: DateTime<Utc>,
    /// Training updates completed when this was taken.
    pub step: u64,
    pub network: SplittingNetwork,
    pub statistics: SplitStatistics,
    pub optimizer: Adam,
}

impl Checkpoint {
    pub fn new(step: u64, network: SplittingNetwork, statistics: SplitStatistics, optimizer: Adam) -> Self {
        Checkpoint {
            saved_at: Utc::now(),
            step,
            network,
            statistics,
            optimizer,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a checkpoint and rejects one whose parts do not fit together:
    /// routing that is not a partition, copies the routing does not know
    /// about, or statistics and optimizer state shaped for another network.
    pub fn from_json(json: &str) -> Result<Self> {
        let ckpt: Checkpoint = serde_json::from_str(json)?;
        ckpt.network.validate()?;
        ckpt.statistics.check_network(&ckpt.network)?;
        ckpt.optimizer.check_network(&ckpt.network)?;
        Ok(ckpt)
    }

    /// Writes to a temporary sibling first and renames it into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, self.to_json()?)?;
        fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), step = self.step, "checkpoint saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
