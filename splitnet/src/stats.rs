//! Gradient divergence statistics and the split trigger.
//!
//! After every backward pass the engine receives one gradient per (task,
//! region). For each region and each pair of tasks routed through the same
//! copy it measures the squared distance between the two gradients, scores
//! that distance against the pair's history as a z-score, and then folds it
//! into the pair's running mean/stdev. Once a copy has been observed for more
//! than `split_step_threshold` steps, its tasks' averaged z-scores are checked
//! for a clean two-way separation, and a split is proposed when the widest gap
//! clears the normal quantile for `split_alpha`.
//!
//! Per (region, copy) lifecycle:
//!
//! ```text
//!  ACCUMULATING ──(steps > threshold)──► ELIGIBLE ──(split applied)──► SPLIT
//!                                                                        │
//!        ◄──────── both resulting copies restart at step 0 ◄────────────┘
//! ```
//!
//! Pair statistics are never reset; only the per-copy step counters are.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::assignment::TaskAssignment;
use crate::error::{Result, SplitError};
use crate::estimate::{EstimatorConfig, RunningMeanStdev};
use crate::gradients::TaskGradients;
use crate::network::SplittingNetwork;

/// Scores within this distance of the widest gap make a partition ambiguous.
const GAP_TIE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// One-sided significance level; the gap threshold is the standard normal
    /// quantile at `1 - split_alpha`.
    pub split_alpha: f64,
    /// A copy must be observed for more than this many steps before it may split.
    pub split_step_threshold: u64,
    /// Added to the pair stdev when forming z-scores.
    pub epsilon: f64,
    pub estimator: EstimatorConfig,
}

impl Default for SplitConfig {
    fn default() -> Self {
        SplitConfig {
            split_alpha: 0.05,
            split_step_threshold: 30,
            epsilon: 1e-8,
            estimator: EstimatorConfig::default(),
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.split_alpha > 0.0 && self.split_alpha < 1.0) {
            return Err(SplitError::InvalidConfig(format!(
                "split_alpha must lie in (0, 1), got {}",
                self.split_alpha
            )));
        }
        if !(self.epsilon > 0.0) {
            return Err(SplitError::InvalidConfig(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        self.estimator.validate()?;
        self.critical_z().map(|_| ())
    }

    /// Standard normal quantile at `1 - split_alpha`.
    pub fn critical_z(&self) -> Result<f64> {
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| SplitError::InvalidConfig(format!("standard normal: {e}")))?;
        Ok(normal.inverse_cdf(1.0 - self.split_alpha))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitPhase {
    Accumulating,
    Eligible,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskScore {
    pub task: usize,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitProposal {
    pub region: usize,
    pub copy: usize,
    /// Lower-scoring tasks; stay on `copy`.
    pub group1: Vec<usize>,
    /// Higher-scoring tasks; move to the new copy.
    pub group2: Vec<usize>,
    pub gap: f64,
}

/// A split that was applied to the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitEvent {
    pub step: u64,
    pub region: usize,
    pub copy: usize,
    pub new_copy: usize,
    pub group1: Vec<usize>,
    pub group2: Vec<usize>,
    /// Steps the parent copy had been observed for when it split.
    pub parent_steps: u64,
    /// `None` for splits requested directly rather than proposed.
    pub gap: Option<f64>,
}

/// What the most recent step measured for one task pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct PairObservation {
    distance: f64,
    z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitStatistics {
    config: SplitConfig,
    num_tasks: usize,
    step: u64,
    /// `pair_stats[region][pair]`
    pair_stats: Vec<Vec<RunningMeanStdev>>,
    /// `latest[region][pair]`, `None` when the pair was not co-assigned and
    /// present on the latest step.
    latest: Vec<Vec<Option<PairObservation>>>,
    /// `copy_steps[region][copy]`
    copy_steps: Vec<Vec<u64>>,
    /// Routing the latest recorded gradients were produced under.
    routing: TaskAssignment,
    history: Vec<SplitEvent>,
}

/// Index of the unordered pair `(a, b)`, `a < b`, among `n` tasks.
#[inline]
fn pair_index(n: usize, a: usize, b: usize) -> usize {
    debug_assert!(a < b && b < n);
    a * (2 * n - a - 1) / 2 + (b - a - 1)
}

impl SplitStatistics {
    /// Fresh statistics for `network`: every pair estimator at step 0.
    pub fn new(network: &SplittingNetwork, config: SplitConfig) -> Result<Self> {
        config.validate()?;
        let num_tasks = network.num_tasks();
        let num_regions = network.num_regions();
        let num_pairs = num_tasks * num_tasks.saturating_sub(1) / 2;
        let routing = network.assignment().clone();
        let copy_steps = (0..num_regions)
            .map(|r| routing.num_copies(r).map(|k| vec![0; k]))
            .collect::<Result<Vec<_>>>()?;
        Ok(SplitStatistics {
            config,
            num_tasks,
            step: 0,
            pair_stats: vec![vec![RunningMeanStdev::scalar(config.estimator); num_pairs]; num_regions],
            latest: vec![vec![None; num_pairs]; num_regions],
            copy_steps,
            routing,
            history: Vec::new(),
        })
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Number of `record_gradients` calls so far.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn history(&self) -> &[SplitEvent] {
        &self.history
    }

    pub fn pair_estimator(&self, region: usize, a: usize, b: usize) -> Option<&RunningMeanStdev> {
        let (a, b) = if a < b { (a, b) } else { (b, a) };
        if a == b || b >= self.num_tasks {
            return None;
        }
        self.pair_stats.get(region)?.get(pair_index(self.num_tasks, a, b))
    }

    /// Distance between two tasks' gradients on the latest step, if measured.
    pub fn latest_distance(&self, region: usize, a: usize, b: usize) -> Option<f64> {
        self.latest_pair(region, a, b).map(|obs| obs.distance)
    }

    fn latest_pair(&self, region: usize, a: usize, b: usize) -> Option<PairObservation> {
        let (a, b) = if a < b { (a, b) } else { (b, a) };
        if a == b || b >= self.num_tasks {
            return None;
        }
        *self.latest.get(region)?.get(pair_index(self.num_tasks, a, b))?
    }

    fn check_copy(&self, region: usize, copy: usize) -> Result<()> {
        let copies = self.copy_steps.get(region).ok_or(SplitError::UnknownRegion {
            region,
            num_regions: self.copy_steps.len(),
        })?;
        if copy >= copies.len() {
            return Err(SplitError::UnknownCopy {
                region,
                copy,
                num_copies: copies.len(),
            });
        }
        Ok(())
    }

    pub fn copy_steps(&self, region: usize, copy: usize) -> Result<u64> {
        self.check_copy(region, copy)?;
        Ok(self.copy_steps[region][copy])
    }

    pub fn phase(&self, region: usize, copy: usize) -> Result<SplitPhase> {
        let steps = self.copy_steps(region, copy)?;
        Ok(if steps > self.config.split_step_threshold {
            SplitPhase::Eligible
        } else {
            SplitPhase::Accumulating
        })
    }

    /// Rejects statistics that could not have been recorded against `network`.
    /// Copies the engine has not seen yet are fine; it adopts them on the next step.
    pub fn check_network(&self, network: &SplittingNetwork) -> Result<()> {
        let num_pairs = self.num_tasks * self.num_tasks.saturating_sub(1) / 2;
        let fits = self.num_tasks == network.num_tasks()
            && self.copy_steps.len() == network.num_regions()
            && self.pair_stats.len() == self.copy_steps.len()
            && self.latest.len() == self.copy_steps.len()
            && self.pair_stats.iter().all(|region| region.len() == num_pairs)
            && self.latest.iter().all(|region| region.len() == num_pairs)
            && self
                .copy_steps
                .iter()
                .zip(network.regions())
                .all(|(steps, region)| steps.len() <= region.num_copies());
        if !fits {
            return Err(SplitError::InvalidConfig(format!(
                "split statistics for {} tasks over {} regions do not match the network",
                self.num_tasks,
                self.copy_steps.len()
            )));
        }
        Ok(())
    }

    /// Adopts copies created outside the engine; they start at step 0.
    fn sync_routing(&mut self, assignment: &TaskAssignment) -> Result<()> {
        if assignment.num_tasks() != self.num_tasks || assignment.num_regions() != self.copy_steps.len() {
            return Err(SplitError::shape(
                "task assignment (tasks, regions)",
                format!("({}, {})", self.num_tasks, self.copy_steps.len()),
                format!("({}, {})", assignment.num_tasks(), assignment.num_regions()),
            ));
        }
        for (r, steps) in self.copy_steps.iter_mut().enumerate() {
            let k = assignment.num_copies(r)?;
            if k > steps.len() {
                steps.resize(k, 0);
            }
        }
        if &self.routing != assignment {
            self.routing = assignment.clone();
        }
        Ok(())
    }

    /// Ingests one step of per-task gradients produced under `assignment`.
    ///
    /// For every region and every pair of present tasks sharing a copy, the
    /// squared gradient distance is scored against the pair's running
    /// statistics and then added to them.
    pub fn record_gradients(&mut self, assignment: &TaskAssignment, grads: &TaskGradients) -> Result<()> {
        let num_regions = self.copy_steps.len();
        if grads.num_tasks() != self.num_tasks || grads.num_regions() != num_regions {
            return Err(SplitError::shape(
                "task gradients (tasks, regions)",
                format!("({}, {})", self.num_tasks, num_regions),
                format!("({}, {})", grads.num_tasks(), grads.num_regions()),
            ));
        }
        self.sync_routing(assignment)?;

        let n = self.num_tasks;
        let eps = self.config.epsilon;
        let maps = (0..num_regions)
            .map(|r| assignment.region_map(r))
            .collect::<Result<Vec<_>>>()?;

        self.pair_stats
            .par_iter_mut()
            .zip(self.latest.par_iter_mut())
            .zip(maps.par_iter())
            .enumerate()
            .try_for_each(|(r, ((stats, latest), map))| -> Result<()> {
                for a in 0..n {
                    for b in (a + 1)..n {
                        let p = pair_index(n, a, b);
                        latest[p] = None;
                        if map[a] != map[b] || !grads.is_present(a) || !grads.is_present(b) {
                            continue;
                        }
                        let Some(distance) = grads.squared_distance(r, a, b) else {
                            continue;
                        };
                        let est = &mut stats[p];
                        let z = (distance - est.scalar_mean()) / (est.scalar_stdev() + eps);
                        est.update_scalar(distance)?;
                        latest[p] = Some(PairObservation { distance, z });
                    }
                }
                Ok(())
            })?;

        self.step += 1;
        let threshold = self.config.split_step_threshold;
        for (region, steps) in self.copy_steps.iter_mut().enumerate() {
            for (copy, s) in steps.iter_mut().enumerate() {
                *s += 1;
                if *s == threshold + 1 {
                    tracing::debug!(region, copy, step = self.step, "copy eligible for splitting");
                }
            }
        }
        Ok(())
    }

    /// One divergence score per task on `(region, copy)`: the mean z-score
    /// over that task's pairs within the copy measured on the latest step.
    /// Tasks with no measured pair are omitted.
    pub fn compute_split_statistic(&self, region: usize, copy: usize) -> Result<Vec<TaskScore>> {
        self.check_copy(region, copy)?;
        let group = self.routing.tasks_on(region, copy)?;
        let mut scores = Vec::with_capacity(group.len());
        for &task in &group {
            let zs: Vec<f64> = group
                .iter()
                .filter(|&&other| other != task)
                .filter_map(|&other| self.latest_pair(region, task, other))
                .map(|obs| obs.z)
                .collect();
            if zs.is_empty() {
                continue;
            }
            scores.push(TaskScore {
                task,
                score: zs.iter().sum::<f64>() / zs.len() as f64,
            });
        }
        Ok(scores)
    }

    /// Proposes a two-way split of `(region, copy)` or returns `None`.
    ///
    /// Requires the copy to be eligible, every task on it to be scored, and
    /// the widest gap between consecutive sorted scores to exceed the
    /// critical z and be unique. Anything marginal or ambiguous is `None`.
    pub fn decide_split(&self, region: usize, copy: usize) -> Result<Option<SplitProposal>> {
        if self.phase(region, copy)? != SplitPhase::Eligible {
            return Ok(None);
        }
        let group = self.routing.tasks_on(region, copy)?;
        if group.len() < 2 {
            return Ok(None);
        }
        let mut scores = self.compute_split_statistic(region, copy)?;
        if scores.len() != group.len() || scores.iter().any(|s| !s.score.is_finite()) {
            tracing::trace!(region, copy, scored = scores.len(), tasks = group.len(), "incomplete scores, no split");
            return Ok(None);
        }
        scores.sort_by(|x, y| x.score.total_cmp(&y.score));

        let gaps: Vec<f64> = scores.windows(2).map(|w| w[1].score - w[0].score).collect();
        let (cut, widest) = gaps
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, g)| if g > best.1 { (i, g) } else { best });

        let critical = self.config.critical_z()?;
        if widest <= critical {
            return Ok(None);
        }
        let ambiguous = gaps
            .iter()
            .enumerate()
            .any(|(i, &g)| i != cut && g >= widest - GAP_TIE_TOLERANCE);
        if ambiguous {
            tracing::trace!(region, copy, widest, "ambiguous partition, no split");
            return Ok(None);
        }

        let mut group1: Vec<usize> = scores[..=cut].iter().map(|s| s.task).collect();
        let mut group2: Vec<usize> = scores[cut + 1..].iter().map(|s| s.task).collect();
        group1.sort_unstable();
        group2.sort_unstable();
        Ok(Some(SplitProposal {
            region,
            copy,
            group1,
            group2,
            gap: widest,
        }))
    }

    /// Evaluates every (region, copy) and applies at most one split: the
    /// proposal with the widest gap, earliest region/copy on ties.
    pub fn check_for_split(&mut self, network: &mut SplittingNetwork) -> Result<Option<SplitEvent>> {
        self.sync_routing(network.assignment())?;
        let mut best: Option<SplitProposal> = None;
        for region in 0..self.copy_steps.len() {
            for copy in 0..self.copy_steps[region].len() {
                if let Some(p) = self.decide_split(region, copy)? {
                    if best.as_ref().map_or(true, |b| p.gap > b.gap) {
                        best = Some(p);
                    }
                }
            }
        }
        let Some(p) = best else {
            return Ok(None);
        };
        self.apply_split(network, p.region, p.copy, &p.group1, &p.group2, Some(p.gap))
            .map(Some)
    }

    /// Splits `network` and restarts the step counters of both resulting copies.
    pub fn apply_split(
        &mut self,
        network: &mut SplittingNetwork,
        region: usize,
        copy: usize,
        group1: &[usize],
        group2: &[usize],
        gap: Option<f64>,
    ) -> Result<SplitEvent> {
        self.sync_routing(network.assignment())?;
        let new_copy = network.split(region, copy, group1, group2)?;
        self.sync_routing(network.assignment())?;

        let parent_steps = self.copy_steps[region][copy];
        self.copy_steps[region][copy] = 0;
        self.copy_steps[region][new_copy] = 0;

        let event = SplitEvent {
            step: self.step,
            region,
            copy,
            new_copy,
            group1: group1.to_vec(),
            group2: group2.to_vec(),
            parent_steps,
            gap,
        };
        tracing::info!(
            step = event.step,
            region,
            copy,
            new_copy,
            parent_steps,
            gap = ?gap,
            "split applied"
        );
        self.history.push(event.clone());
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkConfig;
    use ndarray::Array1;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const NUM_TASKS: usize = 4;

    fn small_network() -> SplittingNetwork {
        let config = NetworkConfig {
            input_size: 2,
            output_size: 2,
            num_tasks: NUM_TASKS,
            num_layers: 2,
            hidden_size: 3,
            ..NetworkConfig::default()
        };
        SplittingNetwork::new(config, 0).unwrap()
    }

    fn region_sizes(net: &SplittingNetwork) -> Vec<usize> {
        net.regions().iter().map(|r| r.copy_size()).collect()
    }

    /// Every task gets `value(task, region)` in every coordinate.
    fn constant_grads(net: &SplittingNetwork, value: impl Fn(usize, usize) -> f64) -> TaskGradients {
        let sizes = region_sizes(net);
        let grads = (0..NUM_TASKS)
            .map(|t| {
                sizes
                    .iter()
                    .enumerate()
                    .map(|(r, &n)| Array1::from_elem(n, value(t, r)))
                    .collect()
            })
            .collect();
        TaskGradients::from_dense(grads).unwrap()
    }

    fn noisy_grads(net: &SplittingNetwork, rng: &mut StdRng, shift: impl Fn(usize) -> f64) -> TaskGradients {
        let sizes = region_sizes(net);
        let grads = (0..NUM_TASKS)
            .map(|t| {
                sizes
                    .iter()
                    .map(|&n| Array1::from_shape_fn(n, |_| 1.0 + shift(t) + rng.gen_range(-0.1..0.1)))
                    .collect()
            })
            .collect();
        TaskGradients::from_dense(grads).unwrap()
    }

    /// Mean and stdev of `history` under `cfg`, written out directly: the
    /// plain average of the first `ema_threshold` values, then each later
    /// value weighted by `(1 - alpha) * alpha^age`.
    fn reference_estimate(history: &[f64], cfg: &EstimatorConfig) -> (f64, f64) {
        if history.is_empty() {
            return (0.0, 0.0);
        }
        let head = &history[..history.len().min(cfg.ema_threshold as usize)];
        let tail = &history[head.len()..];
        let (mut mean, mut sq) = if head.is_empty() {
            (0.0, 0.0)
        } else {
            let n = head.len() as f64;
            (head.iter().sum::<f64>() / n, head.iter().map(|d| d * d).sum::<f64>() / n)
        };
        let alpha = cfg.ema_alpha;
        let k = tail.len() as i32;
        mean *= alpha.powi(k);
        sq *= alpha.powi(k);
        for (j, &d) in tail.iter().enumerate() {
            let w = (1.0 - alpha) * alpha.powi(k - 1 - j as i32);
            mean += w * d;
            sq += w * d * d;
        }
        (mean, (sq - mean * mean).max(0.0).sqrt())
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    fn random_grads(net: &SplittingNetwork, rng: &mut StdRng) -> TaskGradients {
        let sizes = region_sizes(net);
        let grads = (0..NUM_TASKS)
            .map(|_| {
                sizes
                    .iter()
                    .map(|&n| Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0)))
                    .collect()
            })
            .collect();
        TaskGradients::from_dense(grads).unwrap()
    }

    /// Feeds random gradients through `net` for well past the EMA threshold
    /// and checks every distance, z-score, running estimate and task score
    /// against values recomputed from the raw distance history.
    fn check_scores_against_reference(net: &SplittingNetwork, seed: u64) {
        let config = SplitConfig {
            estimator: EstimatorConfig { ema_threshold: 10, ema_alpha: 0.9 },
            ..SplitConfig::default()
        };
        let steps = config.estimator.ema_threshold + 25;
        let mut stats = SplitStatistics::new(net, config).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let num_regions = net.num_regions();
        // history[region][a][b] for a < b
        let mut history = vec![vec![vec![Vec::<f64>::new(); NUM_TASKS]; NUM_TASKS]; num_regions];

        for step in 0..steps {
            let grads = random_grads(net, &mut rng);
            stats.record_gradients(net.assignment(), &grads).unwrap();

            let mut z_ref = vec![vec![vec![None; NUM_TASKS]; NUM_TASKS]; num_regions];
            for r in 0..num_regions {
                let map = net.assignment().region_map(r).unwrap();
                for a in 0..NUM_TASKS {
                    for b in (a + 1)..NUM_TASKS {
                        if map[a] != map[b] {
                            assert!(stats.latest_pair(r, a, b).is_none());
                            assert_eq!(stats.pair_estimator(r, a, b).unwrap().num_steps(), 0);
                            continue;
                        }
                        let ga = grads.get(a, r).unwrap();
                        let gb = grads.get(b, r).unwrap();
                        let d: f64 = ga.iter().zip(gb.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
                        let (mean, stdev) = reference_estimate(&history[r][a][b], &config.estimator);
                        let z = (d - mean) / (stdev + config.epsilon);

                        let obs = stats.latest_pair(r, a, b).unwrap();
                        assert!(close(obs.distance, d), "step {step} region {r} ({a},{b}): d {} vs {d}", obs.distance);
                        assert!(close(obs.z, z), "step {step} region {r} ({a},{b}): z {} vs {z}", obs.z);

                        history[r][a][b].push(d);
                        let (mean, stdev) = reference_estimate(&history[r][a][b], &config.estimator);
                        let est = stats.pair_estimator(r, a, b).unwrap();
                        assert!(close(est.scalar_mean(), mean), "step {step} region {r} ({a},{b}) mean");
                        assert!(close(est.scalar_stdev(), stdev), "step {step} region {r} ({a},{b}) stdev");
                        z_ref[r][a][b] = Some(z);
                        z_ref[r][b][a] = Some(z);
                    }
                }
            }

            for (r, groups) in net.copy_groups().iter().enumerate() {
                for (copy, group) in groups.iter().enumerate() {
                    let scores = stats.compute_split_statistic(r, copy).unwrap();
                    if group.len() < 2 {
                        assert!(scores.is_empty());
                        continue;
                    }
                    assert_eq!(scores.iter().map(|s| s.task).collect::<Vec<_>>(), *group);
                    for s in &scores {
                        let zs: Vec<f64> = group
                            .iter()
                            .filter(|&&o| o != s.task)
                            .filter_map(|&o| z_ref[r][s.task][o])
                            .collect();
                        let expected = zs.iter().sum::<f64>() / zs.len() as f64;
                        assert!(close(s.score, expected), "step {step} region {r} task {}", s.task);
                    }
                }
            }
        }
    }

    fn three_region_network() -> SplittingNetwork {
        let config = NetworkConfig {
            input_size: 2,
            output_size: 2,
            num_tasks: NUM_TASKS,
            num_layers: 3,
            hidden_size: 3,
            ..NetworkConfig::default()
        };
        SplittingNetwork::new(config, 0).unwrap()
    }

    #[test]
    fn test_scores_match_reference_shared() {
        check_scores_against_reference(&three_region_network(), 5);
    }

    #[test]
    fn test_scores_match_reference_split() {
        let mut net = three_region_network();
        net.split(0, 0, &[0, 1], &[2, 3]).unwrap();
        net.split(1, 0, &[0, 2], &[1, 3]).unwrap();
        net.split(1, 1, &[1], &[3]).unwrap();
        net.split(2, 0, &[0, 3], &[1, 2]).unwrap();
        check_scores_against_reference(&net, 6);
    }

    #[test]
    fn test_pair_index_is_dense() {
        let n = 5;
        let mut seen = vec![false; n * (n - 1) / 2];
        for a in 0..n {
            for b in (a + 1)..n {
                let p = pair_index(n, a, b);
                assert!(!seen[p]);
                seen[p] = true;
            }
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn test_critical_z() {
        let z = SplitConfig::default().critical_z().unwrap();
        assert!((z - 1.644_853_626_951_472_2).abs() < 1e-9);
        let strict = SplitConfig { split_alpha: 0.001, ..SplitConfig::default() };
        assert!(strict.critical_z().unwrap() > z);
    }

    #[test]
    fn test_record_tracks_pair_distances() {
        let net = small_network();
        let mut stats = SplitStatistics::new(&net, SplitConfig::default()).unwrap();
        let values = [0.0, -1.0, 1.0, 0.0];
        let grads = constant_grads(&net, |t, _| values[t]);
        for _ in 0..5 {
            stats.record_gradients(net.assignment(), &grads).unwrap();
        }
        let size0 = net.regions()[0].copy_size() as f64;
        let est = stats.pair_estimator(0, 1, 2).unwrap();
        assert_eq!(est.num_steps(), 5);
        assert!((est.scalar_mean() - 4.0 * size0).abs() < 1e-9);
        assert!(est.scalar_stdev() < 1e-6);
        assert_eq!(stats.latest_distance(0, 3, 0), Some(0.0));
        assert_eq!(stats.step(), 5);
    }

    #[test]
    fn test_pairs_on_different_copies_not_updated() {
        let mut net = small_network();
        net.split(1, 0, &[0, 1], &[2, 3]).unwrap();
        let mut stats = SplitStatistics::new(&net, SplitConfig::default()).unwrap();
        let grads = constant_grads(&net, |t, _| t as f64);
        stats.record_gradients(net.assignment(), &grads).unwrap();

        assert_eq!(stats.pair_estimator(1, 0, 2).unwrap().num_steps(), 0);
        assert_eq!(stats.pair_estimator(1, 2, 3).unwrap().num_steps(), 1);
        assert_eq!(stats.pair_estimator(0, 0, 2).unwrap().num_steps(), 1);
        assert_eq!(stats.latest_distance(1, 1, 3), None);
    }

    #[test]
    fn test_phase_transitions() {
        let net = small_network();
        let config = SplitConfig { split_step_threshold: 3, ..SplitConfig::default() };
        let mut stats = SplitStatistics::new(&net, config).unwrap();
        let grads = constant_grads(&net, |_, _| 0.5);
        for _ in 0..3 {
            stats.record_gradients(net.assignment(), &grads).unwrap();
            assert_eq!(stats.phase(0, 0).unwrap(), SplitPhase::Accumulating);
        }
        stats.record_gradients(net.assignment(), &grads).unwrap();
        assert_eq!(stats.phase(0, 0).unwrap(), SplitPhase::Eligible);
        assert!(stats.phase(0, 1).is_err());
    }

    #[test]
    fn test_identical_gradients_never_split() {
        let mut net = small_network();
        let config = SplitConfig {
            split_step_threshold: 5,
            estimator: EstimatorConfig { ema_threshold: 20, ema_alpha: 0.99 },
            ..SplitConfig::default()
        };
        let mut stats = SplitStatistics::new(&net, config).unwrap();
        let grads = constant_grads(&net, |_, r| 0.25 + r as f64);
        for _ in 0..60 {
            stats.record_gradients(net.assignment(), &grads).unwrap();
            for r in 0..net.num_regions() {
                assert_eq!(stats.decide_split(r, 0).unwrap(), None);
                for s in stats.compute_split_statistic(r, 0).unwrap() {
                    assert_eq!(s.score, 0.0);
                }
            }
            assert_eq!(stats.check_for_split(&mut net).unwrap(), None);
        }
        assert_eq!(net.num_params(), small_network().num_params());
    }

    #[test]
    fn test_divergent_task_is_split_off() {
        let mut net = small_network();
        let config = SplitConfig { split_step_threshold: 30, ..SplitConfig::default() };
        let mut stats = SplitStatistics::new(&net, config).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..40 {
            let grads = noisy_grads(&net, &mut rng, |_| 0.0);
            stats.record_gradients(net.assignment(), &grads).unwrap();
        }
        // task 3 jumps away from the others on this step
        let grads = noisy_grads(&net, &mut rng, |t| if t == 3 { 5.0 } else { 0.0 });
        stats.record_gradients(net.assignment(), &grads).unwrap();

        let proposal = stats.decide_split(0, 0).unwrap().expect("task 3 should split off");
        assert_eq!(proposal.group1, vec![0, 1, 2]);
        assert_eq!(proposal.group2, vec![3]);
        assert!(proposal.gap > stats.config().critical_z().unwrap());

        let scores = stats.compute_split_statistic(0, 0).unwrap();
        let top = scores.iter().max_by(|a, b| a.score.total_cmp(&b.score)).unwrap();
        assert_eq!(top.task, 3);

        let event = stats.check_for_split(&mut net).unwrap().expect("split applied");
        assert_eq!(event.group2, vec![3]);
        assert_eq!(event.new_copy, 1);
        assert_eq!(net.assignment().copy_of(event.region, 3).unwrap(), 1);
        assert_eq!(stats.copy_steps(event.region, 0).unwrap(), 0);
        assert_eq!(stats.copy_steps(event.region, 1).unwrap(), 0);
        assert_eq!(stats.phase(event.region, 1).unwrap(), SplitPhase::Accumulating);
        assert_eq!(stats.history().len(), 1);
        // pair statistics survive the split
        assert_eq!(stats.pair_estimator(event.region, 0, 1).unwrap().num_steps(), 41);
    }

    #[test]
    fn test_accumulating_copy_never_proposes() {
        let net = small_network();
        let mut stats = SplitStatistics::new(&net, SplitConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            let grads = noisy_grads(&net, &mut rng, |t| t as f64 * 3.0);
            stats.record_gradients(net.assignment(), &grads).unwrap();
        }
        assert_eq!(stats.decide_split(0, 0).unwrap(), None);
    }

    #[test]
    fn test_manual_split_resets_counters() {
        let mut net = small_network();
        let mut stats = SplitStatistics::new(&net, SplitConfig::default()).unwrap();
        let grads = constant_grads(&net, |t, _| t as f64);
        for _ in 0..4 {
            stats.record_gradients(net.assignment(), &grads).unwrap();
        }
        let event = stats.apply_split(&mut net, 0, 0, &[0, 1, 2], &[3], None).unwrap();
        assert_eq!(event.parent_steps, 4);
        assert_eq!(stats.copy_steps(0, 0).unwrap(), 0);
        assert_eq!(stats.copy_steps(1, 0).unwrap(), 4);

        let err = stats.apply_split(&mut net, 0, 0, &[0, 1], &[1, 2], None).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(stats.history().len(), 1);
    }

    #[test]
    fn test_copies_split_outside_engine_are_adopted() {
        let mut net = small_network();
        let mut stats = SplitStatistics::new(&net, SplitConfig::default()).unwrap();
        net.split(0, 0, &[0], &[1, 2, 3]).unwrap();
        let grads = constant_grads(&net, |_, _| 1.0);
        stats.record_gradients(net.assignment(), &grads).unwrap();
        assert_eq!(stats.copy_steps(0, 1).unwrap(), 1);
    }

    #[test]
    fn test_mismatched_gradients_rejected() {
        let net = small_network();
        let mut stats = SplitStatistics::new(&net, SplitConfig::default()).unwrap();
        let grads = TaskGradients::from_dense(vec![vec![Array1::zeros(3)]; NUM_TASKS]).unwrap();
        assert!(matches!(
            stats.record_gradients(net.assignment(), &grads),
            Err(SplitError::ShapeMismatch { .. })
        ));
        assert_eq!(stats.step(), 0);
    }

    #[test]
    fn test_invalid_config() {
        let net = small_network();
        let bad = SplitConfig { split_alpha: 0.0, ..SplitConfig::default() };
        assert!(SplitStatistics::new(&net, bad).is_err());
        let bad = SplitConfig { epsilon: -1.0, ..SplitConfig::default() };
        assert!(SplitStatistics::new(&net, bad).is_err());
    }
}
