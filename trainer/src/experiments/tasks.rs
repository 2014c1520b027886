//! Synthetic multi-task regression with optional concept drift.
//!
//! Every task starts on the same linear target map. At `drift_step` the
//! tasks listed in `drifting_tasks` switch to a second map, which makes
//! their gradients diverge from the rest and gives the split trigger
//! something to find.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};
use splitnet::NetworkConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Std of Gaussian noise added to every target.
    pub target_noise: f64,
    /// Update index from which the drifting tasks use the second map.
    pub drift_step: Option<u64>,
    pub drifting_tasks: Vec<usize>,
    /// Give every task the same observations within an update.
    pub shared_inputs: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            target_noise: 0.0,
            drift_step: Some(500),
            drifting_tasks: vec![3],
            shared_inputs: true,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self, network: &NetworkConfig) -> Result<()> {
        if !(self.target_noise >= 0.0) {
            bail!("target_noise must be non-negative, got {}", self.target_noise);
        }
        if let Some(&task) = self.drifting_tasks.iter().find(|&&t| t >= network.num_tasks) {
            bail!("drifting task {task} out of range (num_tasks = {})", network.num_tasks);
        }
        Ok(())
    }
}

/// One update's worth of rows, grouped by task.
#[derive(Debug, Clone)]
pub struct Batch {
    pub obs: Array2<f64>,
    pub tasks: Vec<usize>,
    pub targets: Array2<f64>,
}

#[derive(Debug, Clone)]
struct TargetMap {
    weight: Array2<f64>,
    bias: Array1<f64>,
}

impl TargetMap {
    fn random(input: usize, output: usize, rng: &mut StdRng) -> Self {
        let scale = 1.0 / (input as f64).sqrt();
        TargetMap {
            weight: Array2::from_shape_fn((output, input), |_| {
                let z: f64 = rng.sample(StandardNormal);
                z * scale
            }),
            bias: Array1::from_shape_fn(output, |_| rng.gen_range(-0.5..0.5)),
        }
    }

    fn apply(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.weight.t()) + &self.bias
    }
}

pub struct MultiTaskRegression {
    config: WorkloadConfig,
    num_tasks: usize,
    input_size: usize,
    before: TargetMap,
    after: TargetMap,
}

impl MultiTaskRegression {
    pub fn new(config: WorkloadConfig, network: &NetworkConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let before = TargetMap::random(network.input_size, network.output_size, &mut rng);
        let after = TargetMap::random(network.input_size, network.output_size, &mut rng);
        MultiTaskRegression {
            config,
            num_tasks: network.num_tasks,
            input_size: network.input_size,
            before,
            after,
        }
    }

    pub fn has_drifted(&self, task: usize, update: u64) -> bool {
        self.config.drift_step.map_or(false, |d| update >= d) && self.config.drifting_tasks.contains(&task)
    }

    /// `rows` observations per task for update `update`.
    pub fn sample(&self, update: u64, rows: usize, rng: &mut StdRng) -> Result<Batch> {
        let draw = |rng: &mut StdRng| {
            Array2::from_shape_fn((rows, self.input_size), |_| rng.sample::<f64, _>(StandardNormal))
        };
        let shared = self.config.shared_inputs.then(|| draw(rng));
        let blocks: Vec<Array2<f64>> = (0..self.num_tasks)
            .map(|_| shared.clone().unwrap_or_else(|| draw(rng)))
            .collect();

        let noise_std = self.config.target_noise;
        let noise = if noise_std > 0.0 { Normal::new(0.0, noise_std).ok() } else { None };
        let mut targets = Vec::with_capacity(self.num_tasks);
        for (task, x) in blocks.iter().enumerate() {
            let map = if self.has_drifted(task, update) { &self.after } else { &self.before };
            let mut y = map.apply(x);
            if let Some(noise) = noise {
                y.mapv_inplace(|v| v + noise.sample(rng));
            }
            targets.push(y);
        }

        let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
        let target_views: Vec<_> = targets.iter().map(|t| t.view()).collect();
        Ok(Batch {
            obs: ndarray::concatenate(Axis(0), &views)?,
            tasks: (0..self.num_tasks).flat_map(|t| std::iter::repeat(t).take(rows)).collect(),
            targets: ndarray::concatenate(Axis(0), &target_views)?,
        })
    }
}

/// Mean squared error over the batch, its gradient w.r.t. the output, and
/// the per-task MSE.
pub fn mse(output: &Array2<f64>, batch: &Batch, num_tasks: usize) -> (f64, Array2<f64>, Vec<f64>) {
    let diff = output - &batch.targets;
    let n = diff.len().max(1) as f64;
    let loss = diff.mapv(|d| d * d).sum() / n;
    let grad = diff.mapv(|d| 2.0 * d / n);

    let mut sums = vec![0.0; num_tasks];
    let mut counts = vec![0usize; num_tasks];
    for (row, &task) in diff.outer_iter().zip(&batch.tasks) {
        sums[task] += row.mapv(|d| d * d).sum();
        counts[task] += row.len();
    }
    let per_task = sums
        .into_iter()
        .zip(counts)
        .map(|(s, c)| if c == 0 { 0.0 } else { s / c as f64 })
        .collect();
    (loss, grad, per_task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> NetworkConfig {
        NetworkConfig { input_size: 3, output_size: 2, num_tasks: 4, ..NetworkConfig::default() }
    }

    #[test]
    fn test_batch_layout() {
        let task = MultiTaskRegression::new(WorkloadConfig::default(), &network(), 0);
        let mut rng = StdRng::seed_from_u64(1);
        let batch = task.sample(0, 5, &mut rng).unwrap();
        assert_eq!(batch.obs.dim(), (20, 3));
        assert_eq!(batch.targets.dim(), (20, 2));
        assert_eq!(&batch.tasks[..6], &[0, 0, 0, 0, 0, 1]);
        // shared inputs: every task sees the same rows
        assert_eq!(batch.obs.slice(ndarray::s![0..5, ..]), batch.obs.slice(ndarray::s![15..20, ..]));
        assert_eq!(batch.targets.slice(ndarray::s![0..5, ..]), batch.targets.slice(ndarray::s![15..20, ..]));
    }

    #[test]
    fn test_drift_changes_only_drifting_tasks() {
        let cfg = WorkloadConfig { drift_step: Some(10), ..WorkloadConfig::default() };
        let task = MultiTaskRegression::new(cfg, &network(), 0);
        assert!(!task.has_drifted(3, 9));
        assert!(task.has_drifted(3, 10));
        assert!(!task.has_drifted(2, 10));

        let batch = task.sample(10, 4, &mut StdRng::seed_from_u64(2)).unwrap();
        let t0 = batch.targets.slice(ndarray::s![0..4, ..]);
        let t2 = batch.targets.slice(ndarray::s![8..12, ..]);
        let t3 = batch.targets.slice(ndarray::s![12..16, ..]);
        assert_eq!(t0, t2);
        assert_ne!(t0, t3);
    }

    #[test]
    fn test_mse_per_task() {
        let batch = Batch {
            obs: Array2::zeros((3, 1)),
            tasks: vec![0, 0, 1],
            targets: ndarray::array![[1.0], [1.0], [0.0]],
        };
        let output = ndarray::array![[0.0], [2.0], [3.0]];
        let (loss, grad, per_task) = mse(&output, &batch, 3);
        assert!((loss - 11.0 / 3.0).abs() < 1e-12);
        assert_eq!(grad, ndarray::array![[-2.0 / 3.0], [2.0 / 3.0], [2.0]]);
        assert_eq!(per_task, vec![1.0, 9.0, 0.0]);
    }

    #[test]
    fn test_invalid_drifting_task() {
        let cfg = WorkloadConfig { drifting_tasks: vec![4], ..WorkloadConfig::default() };
        assert!(cfg.validate(&network()).is_err());
    }
}
