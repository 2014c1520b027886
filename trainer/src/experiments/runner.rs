//! Training loop for the splitting network.
//!
//! Each update runs forward → MSE → backward → record gradients → Adam →
//! split check, in that order, so a split only ever changes the structure
//! between updates.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use splitnet::{Adam, Checkpoint, SplitEvent, SplitStatistics, SplittingNetwork};

use super::tasks::{mse, MultiTaskRegression};
use crate::config::TrainConfig;

/// Per-update progress.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub update: u64,
    pub loss: f64,
    pub task_loss: Vec<f64>,
    pub grad_norm: f64,
    pub num_params: usize,
    pub split: Option<SplitEvent>,
    pub time: f64,
}

/// Final result.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub name: String,
    pub updates: u64,
    pub resumed_from: Option<u64>,
    pub final_loss: f64,
    pub final_task_loss: Vec<f64>,
    pub num_params: usize,
    pub splits: Vec<SplitEvent>,
    /// `copy_groups[region][copy]` = tasks on that copy at the end of the run.
    pub copy_groups: Vec<Vec<Vec<usize>>>,
    pub elapsed: f64,
}

pub struct Trainer {
    cfg: TrainConfig,
    network: SplittingNetwork,
    stats: SplitStatistics,
    adam: Adam,
    workload: MultiTaskRegression,
    step: u64,
}

impl Trainer {
    pub fn new(cfg: &TrainConfig) -> Result<Self> {
        let network = SplittingNetwork::new(cfg.network.clone(), cfg.seed)?;
        let stats = SplitStatistics::new(&network, cfg.split)?;
        let adam = Adam::new(&network, cfg.adam)?;
        Ok(Trainer {
            cfg: cfg.clone(),
            workload: MultiTaskRegression::new(cfg.workload.clone(), &cfg.network, cfg.seed),
            network,
            stats,
            adam,
            step: 0,
        })
    }

    pub fn from_checkpoint(cfg: &TrainConfig, ckpt: Checkpoint) -> Result<Self> {
        if ckpt.network.config() != &cfg.network {
            bail!("checkpoint network config does not match the run config");
        }
        Ok(Trainer {
            cfg: cfg.clone(),
            workload: MultiTaskRegression::new(cfg.workload.clone(), &cfg.network, cfg.seed),
            network: ckpt.network,
            stats: ckpt.statistics,
            adam: ckpt.optimizer,
            step: ckpt.step,
        })
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn network(&self) -> &SplittingNetwork {
        &self.network
    }

    pub fn statistics(&self) -> &SplitStatistics {
        &self.stats
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.step, self.network.clone(), self.stats.clone(), self.adam.clone())
    }

    pub fn update(&mut self, start: Instant) -> Result<UpdateResult> {
        let update = self.step;
        if self.cfg.workload.drift_step == Some(update) {
            tracing::info!(update, tasks = ?self.cfg.workload.drifting_tasks, "workload drift");
        }

        // seeded per update so a resumed run draws the same batches
        let mut rng = StdRng::seed_from_u64(self.cfg.seed.wrapping_add(update));
        let batch = self.workload.sample(update, self.cfg.batch_size, &mut rng)?;

        let cache = self.network.forward_cached(batch.obs.view(), &batch.tasks)?;
        let (loss, d_output, task_loss) = mse(cache.output(), &batch, self.network.num_tasks());
        let grads = self.network.backward(&cache, d_output.view())?;

        self.stats.record_gradients(self.network.assignment(), &grads.tasks)?;
        let grad_norm = self.adam.step(&mut self.network, &grads)?;

        let split = self.stats.check_for_split(&mut self.network)?;
        if let Some(event) = &split {
            self.adam
                .on_split(event.region, event.copy, event.new_copy)
                .context("cloning optimizer state for split")?;
        }
        self.step += 1;

        Ok(UpdateResult {
            update,
            loss,
            task_loss,
            grad_norm,
            num_params: self.network.num_params(),
            split,
            time: start.elapsed().as_secs_f64(),
        })
    }

    fn save(&self) -> Result<()> {
        if let Some(path) = self.cfg.checkpoint_path() {
            self.checkpoint()
                .save(&path)
                .with_context(|| format!("saving checkpoint to {}", path.display()))?;
        }
        Ok(())
    }
}

/// Runs `cfg.num_updates` updates in total, resuming from the latest
/// checkpoint when `resume` is set and one exists.
pub fn run(cfg: &TrainConfig, resume: bool, mut on_update: impl FnMut(&UpdateResult)) -> Result<RunResult> {
    cfg.validate()?;

    let ckpt_path = cfg.checkpoint_path();
    let mut trainer = match ckpt_path.as_deref().filter(|p| resume && p.exists()) {
        Some(path) => {
            let ckpt = Checkpoint::load(path)
                .with_context(|| format!("loading checkpoint {}", path.display()))?;
            tracing::info!(path = %path.display(), step = ckpt.step, saved_at = %ckpt.saved_at, "resuming");
            Trainer::from_checkpoint(cfg, ckpt)?
        }
        None => {
            if resume {
                tracing::warn!("no checkpoint to resume from, starting fresh");
            }
            Trainer::new(cfg)?
        }
    };
    let resumed_from = (trainer.step() > 0).then_some(trainer.step());

    tracing::info!(
        name = %cfg.name,
        tasks = cfg.network.num_tasks,
        regions = cfg.network.num_layers,
        params = trainer.network().num_params(),
        updates = cfg.num_updates,
        "starting run"
    );

    let start = Instant::now();
    let mut last: Option<UpdateResult> = None;
    while trainer.step() < cfg.num_updates {
        let result = trainer.update(start)?;
        let update = result.update;
        if cfg.print_freq > 0 && (update + 1) % cfg.print_freq == 0 {
            tracing::info!(
                update = update + 1,
                loss = result.loss,
                task_loss = ?result.task_loss,
                grad_norm = result.grad_norm,
                params = result.num_params,
                splits = trainer.statistics().history().len(),
                "progress"
            );
        }
        on_update(&result);
        last = Some(result);

        if cfg.checkpoint_freq > 0 && (update + 1) % cfg.checkpoint_freq == 0 {
            trainer.save()?;
        }
    }
    trainer.save()?;

    let (final_loss, final_task_loss) = last
        .map(|r| (r.loss, r.task_loss))
        .unwrap_or((f64::NAN, Vec::new()));

    Ok(RunResult {
        name: cfg.name.clone(),
        updates: trainer.step(),
        resumed_from,
        final_loss,
        final_task_loss,
        num_params: trainer.network().num_params(),
        splits: trainer.statistics().history().to_vec(),
        copy_groups: trainer.network().copy_groups(),
        elapsed: start.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitnet::{NetworkConfig, SplitConfig};

    fn small_config(name: &str) -> TrainConfig {
        let mut cfg = TrainConfig {
            name: name.into(),
            num_updates: 60,
            batch_size: 6,
            print_freq: 0,
            network: NetworkConfig {
                input_size: 3,
                output_size: 2,
                num_tasks: 4,
                num_layers: 3,
                hidden_size: 8,
                ..NetworkConfig::default()
            },
            split: SplitConfig { split_step_threshold: 30, ..SplitConfig::default() },
            ..TrainConfig::default()
        };
        cfg.workload.drift_step = Some(40);
        cfg
    }

    #[test]
    fn test_drift_triggers_split() {
        let cfg = small_config("drift");
        let mut seen = 0;
        let result = run(&cfg, false, |_| seen += 1).unwrap();
        assert_eq!(seen, 60);
        assert_eq!(result.updates, 60);
        let first = result.splits.first().expect("drifting task should split off");
        assert_eq!(first.step, 41);
        assert!(first.group1 == vec![3] || first.group2 == vec![3]);
        assert!(result.num_params > SplittingNetwork::new(cfg.network.clone(), cfg.seed).unwrap().num_params());
        assert!(result.final_loss.is_finite());
    }

    #[test]
    fn test_no_drift_no_split() {
        let mut cfg = small_config("steady");
        cfg.workload.drift_step = None;
        let result = run(&cfg, false, |_| {}).unwrap();
        assert!(result.splits.is_empty());
        assert!(result.copy_groups.iter().all(|region| region.len() == 1));
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let dir = std::env::temp_dir().join(format!("splitnet-trainer-{}", std::process::id()));
        let straight = run(&small_config("straight"), false, |_| {}).unwrap();

        let mut first_half = small_config("resumed");
        first_half.checkpoint_dir = Some(dir.clone());
        first_half.num_updates = 30;
        let partial = run(&first_half, false, |_| {}).unwrap();
        assert_eq!(partial.updates, 30);

        let second_half = TrainConfig { num_updates: 60, ..first_half };
        let resumed = run(&second_half, true, |_| {}).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(resumed.resumed_from, Some(30));
        assert_eq!(resumed.updates, 60);
        assert_eq!(resumed.final_loss, straight.final_loss);
        assert_eq!(resumed.splits.len(), straight.splits.len());
        assert_eq!(resumed.copy_groups, straight.copy_groups);
    }

    #[test]
    fn test_mismatched_checkpoint_rejected() {
        let cfg = small_config("mismatch");
        let trainer = Trainer::new(&cfg).unwrap();
        let mut other = cfg.clone();
        other.network.hidden_size = 4;
        assert!(Trainer::from_checkpoint(&other, trainer.checkpoint()).is_err());
    }
}
