//! The splitting multi-task MLP.
//!
//! Regions are stored as an arena: each region owns a dense list of parameter
//! copies, and a separate [`TaskAssignment`] says which copy every task uses
//! at every region. Splitting a copy clones its parameters into a new slot and
//! re-points part of its task group there, so no layer ever changes type.

use ndarray::{s, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::assignment::TaskAssignment;
use crate::error::{Result, SplitError};
use crate::gradients::{NetworkGradients, TaskGradients};
use crate::region::{Activation, Linear, Region};

/// Architecture of a [`SplittingNetwork`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Width of the observation rows passed to `forward`.
    pub input_size: usize,
    pub output_size: usize,
    pub num_tasks: usize,
    /// Number of regions (layers).
    pub num_layers: usize,
    pub hidden_size: usize,
    pub hidden_activation: Activation,
    pub output_activation: Activation,
    /// Append a one-hot task block to every observation before region 0.
    pub include_task_index: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            input_size: 8,
            output_size: 4,
            num_tasks: 4,
            num_layers: 3,
            hidden_size: 64,
            hidden_activation: Activation::Tanh,
            output_activation: Activation::Identity,
            include_task_index: false,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(SplitError::InvalidConfig(msg.to_string()));
        if self.num_layers == 0 {
            return fail("num_layers must be at least 1");
        }
        if self.num_tasks == 0 {
            return fail("num_tasks must be at least 1");
        }
        if self.input_size == 0 || self.output_size == 0 {
            return fail("input_size and output_size must be positive");
        }
        if self.num_layers > 1 && self.hidden_size == 0 {
            return fail("hidden_size must be positive when num_layers > 1");
        }
        Ok(())
    }

    /// Input width of region 0, including the optional task block.
    pub fn region_input_size(&self) -> usize {
        if self.include_task_index {
            self.input_size + self.num_tasks
        } else {
            self.input_size
        }
    }

    /// `(fan_in, fan_out)` for each region.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut dims = Vec::with_capacity(self.num_layers);
        let mut prev = self.region_input_size();
        for _ in 1..self.num_layers {
            dims.push((prev, self.hidden_size));
            prev = self.hidden_size;
        }
        dims.push((prev, self.output_size));
        dims
    }
}

/// Stable reference to one parameter copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CopyHandle {
    pub region: usize,
    pub copy: usize,
}

/// Intermediate values of one forward pass, kept for `backward`.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    tasks: Vec<usize>,
    /// `rows[region][copy]` = batch rows routed through that copy.
    rows: Vec<Vec<Vec<usize>>>,
    /// Input to each region.
    inputs: Vec<Array2<f64>>,
    pre_activations: Vec<Array2<f64>>,
    output: Array2<f64>,
    version: u64,
}

impl ForwardCache {
    pub fn output(&self) -> &Array2<f64> {
        &self.output
    }

    pub fn into_output(self) -> Array2<f64> {
        self.output
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplittingNetwork {
    config: NetworkConfig,
    regions: Vec<Region>,
    assignment: TaskAssignment,
    /// Bumped on every structural mutation.
    version: u64,
}

impl SplittingNetwork {
    pub fn new(config: NetworkConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let last = config.num_layers - 1;
        let regions = config
            .layer_dims()
            .into_iter()
            .enumerate()
            .map(|(i, (fan_in, fan_out))| {
                let act = if i == last {
                    config.output_activation
                } else {
                    config.hidden_activation
                };
                Region::new(fan_in, fan_out, act, &mut rng)
            })
            .collect();
        let assignment = TaskAssignment::shared(config.num_layers, config.num_tasks);
        Ok(SplittingNetwork {
            config,
            regions,
            assignment,
            version: 0,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn num_tasks(&self) -> usize {
        self.config.num_tasks
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn assignment(&self) -> &TaskAssignment {
        &self.assignment
    }

    /// Bumped by every split; a `ForwardCache` from an older version is stale.
    pub fn structure_version(&self) -> u64 {
        self.version
    }

    /// Checks that regions, copies and routing agree with each other and with
    /// the config. Only needed for networks that were not built through `new`
    /// and `split`, such as a deserialized checkpoint.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        let dims = self.config.layer_dims();
        if self.regions.len() != dims.len() {
            return Err(SplitError::InvalidConfig(format!(
                "network has {} regions, config expects {}",
                self.regions.len(),
                dims.len()
            )));
        }
        let assignment = &self.assignment;
        if assignment.num_tasks() != self.config.num_tasks || assignment.num_regions() != self.regions.len() {
            return Err(SplitError::InvalidConfig(format!(
                "task assignment covers {} tasks over {} regions, network has {} tasks over {}",
                assignment.num_tasks(),
                assignment.num_regions(),
                self.config.num_tasks,
                self.regions.len()
            )));
        }
        if !assignment.is_partition() {
            return Err(SplitError::InvalidConfig("task assignment is not a partition".to_string()));
        }
        for (r, (region, &(fan_in, fan_out))) in self.regions.iter().zip(&dims).enumerate() {
            let routed = assignment.num_copies(r)?;
            if region.num_copies() != routed {
                return Err(SplitError::InvalidConfig(format!(
                    "region {r} has {} copies but the assignment routes to {routed}",
                    region.num_copies()
                )));
            }
            let bad_shape = region.copies().iter().any(|p| {
                p.weight.dim() != (fan_out, fan_in) || p.bias.len() != fan_out
            });
            if bad_shape {
                return Err(SplitError::InvalidConfig(format!(
                    "region {r} has a copy that is not {fan_out}x{fan_in}"
                )));
            }
        }
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        self.regions
            .iter()
            .map(|r| r.num_copies() * r.copy_size())
            .sum()
    }

    /// Handles for every live copy, region-major.
    pub fn copy_handles(&self) -> Vec<CopyHandle> {
        self.regions
            .iter()
            .enumerate()
            .flat_map(|(region, r)| (0..r.num_copies()).map(move |copy| CopyHandle { region, copy }))
            .collect()
    }

    pub fn parameters(&self, handle: CopyHandle) -> Result<&Linear> {
        let num_regions = self.regions.len();
        let region = self
            .regions
            .get(handle.region)
            .ok_or(SplitError::UnknownRegion { region: handle.region, num_regions })?;
        region.copy(handle.copy).ok_or(SplitError::UnknownCopy {
            region: handle.region,
            copy: handle.copy,
            num_copies: region.num_copies(),
        })
    }

    pub fn parameters_mut(&mut self, handle: CopyHandle) -> Result<&mut Linear> {
        let num_regions = self.regions.len();
        let region = self
            .regions
            .get_mut(handle.region)
            .ok_or(SplitError::UnknownRegion { region: handle.region, num_regions })?;
        let num_copies = region.num_copies();
        region.copy_mut(handle.copy).ok_or(SplitError::UnknownCopy {
            region: handle.region,
            copy: handle.copy,
            num_copies,
        })
    }

    /// Replaces a copy's parameters; the new block must have the same shape.
    pub fn set_parameters(&mut self, handle: CopyHandle, params: Linear) -> Result<()> {
        let slot = self.parameters_mut(handle)?;
        if slot.weight.dim() != params.weight.dim() || slot.bias.len() != params.bias.len() {
            return Err(SplitError::shape(
                "copy parameters",
                format!("{:?}", slot.weight.dim()),
                format!("{:?}", params.weight.dim()),
            ));
        }
        *slot = params;
        Ok(())
    }

    /// The copy each region routes `task` through.
    pub fn task_path(&self, task: usize) -> Result<Vec<usize>> {
        (0..self.regions.len())
            .map(|r| self.assignment.copy_of(r, task))
            .collect()
    }

    /// `groups[region][copy]` = tasks on that copy.
    pub fn copy_groups(&self) -> Vec<Vec<Vec<usize>>> {
        (0..self.regions.len())
            .filter_map(|r| self.assignment.copy_groups(r).ok())
            .collect()
    }

    fn prepare_input(&self, obs: ArrayView2<'_, f64>, tasks: &[usize]) -> Result<Array2<f64>> {
        if obs.ncols() != self.config.input_size {
            return Err(SplitError::shape("observation width", self.config.input_size, obs.ncols()));
        }
        if obs.nrows() != tasks.len() {
            return Err(SplitError::shape("task indices per batch row", obs.nrows(), tasks.len()));
        }
        for &task in tasks {
            self.assignment.check_task(task)?;
        }
        if !self.config.include_task_index {
            return Ok(obs.to_owned());
        }
        let width = self.config.region_input_size();
        let mut x = Array2::zeros((obs.nrows(), width));
        x.slice_mut(s![.., ..self.config.input_size]).assign(&obs);
        for (row, &task) in tasks.iter().enumerate() {
            x[[row, self.config.input_size + task]] = 1.0;
        }
        Ok(x)
    }

    /// Batch rows grouped by the copy they use at `region`.
    fn route(&self, region: usize, tasks: &[usize]) -> Vec<Vec<usize>> {
        let map = self.assignment_map(region);
        let mut rows = vec![Vec::new(); self.regions[region].num_copies()];
        for (row, &task) in tasks.iter().enumerate() {
            rows[map[task]].push(row);
        }
        rows
    }

    fn assignment_map(&self, region: usize) -> &[usize] {
        // region indices here always come from iterating self.regions
        self.assignment.region_map(region).unwrap_or(&[])
    }

    pub fn forward(&self, obs: ArrayView2<'_, f64>, tasks: &[usize]) -> Result<Array2<f64>> {
        Ok(self.forward_cached(obs, tasks)?.into_output())
    }

    /// Forward pass that keeps what `backward` needs.
    ///
    /// Each region evaluates one sub-batch per copy and scatters the results
    /// back into original row order, so a row's output depends only on that
    /// row and its task's path.
    pub fn forward_cached(&self, obs: ArrayView2<'_, f64>, tasks: &[usize]) -> Result<ForwardCache> {
        let mut x = self.prepare_input(obs, tasks)?;
        let n = tasks.len();
        let mut rows = Vec::with_capacity(self.regions.len());
        let mut inputs = Vec::with_capacity(self.regions.len());
        let mut pre_activations = Vec::with_capacity(self.regions.len());

        for (r, region) in self.regions.iter().enumerate() {
            let routed = self.route(r, tasks);
            let mut z = Array2::zeros((n, region.output_size()));
            for (copy, copy_rows) in routed.iter().enumerate() {
                if copy_rows.is_empty() {
                    continue;
                }
                let sub = x.select(Axis(0), copy_rows);
                let out = region.copies()[copy].forward(sub.view());
                for (k, &row) in copy_rows.iter().enumerate() {
                    z.row_mut(row).assign(&out.row(k));
                }
            }
            let act = region.activation();
            let a = z.mapv(|v| act.apply(v));
            rows.push(routed);
            inputs.push(x);
            pre_activations.push(z);
            x = a;
        }

        Ok(ForwardCache {
            tasks: tasks.to_vec(),
            rows,
            inputs,
            pre_activations,
            output: x,
            version: self.version,
        })
    }

    /// Backpropagates `d_output` (dL/d output, one row per batch row).
    ///
    /// Returns summed gradients per copy and, per task and region, the
    /// gradient of that task's rows with respect to the copy the task was
    /// routed through, flattened in the region's shared layout.
    pub fn backward(&self, cache: &ForwardCache, d_output: ArrayView2<'_, f64>) -> Result<NetworkGradients> {
        if cache.version != self.version {
            return Err(SplitError::StaleForwardCache {
                cached: cache.version,
                current: self.version,
            });
        }
        if d_output.dim() != cache.output.dim() {
            return Err(SplitError::shape(
                "output gradient",
                format!("{:?}", cache.output.dim()),
                format!("{:?}", d_output.dim()),
            ));
        }

        let num_tasks = self.config.num_tasks;
        let num_regions = self.regions.len();
        let mut task_rows = vec![Vec::new(); num_tasks];
        for (row, &task) in cache.tasks.iter().enumerate() {
            task_rows[task].push(row);
        }
        let present: Vec<bool> = task_rows.iter().map(|r| !r.is_empty()).collect();

        let mut copy_grads: Vec<Vec<Linear>> = vec![Vec::new(); num_regions];
        let mut task_grads: Vec<Vec<ndarray::Array1<f64>>> =
            vec![Vec::with_capacity(num_regions); num_tasks];
        // filled back to front, reversed at the end
        let mut delta = d_output.to_owned();

        for r in (0..num_regions).rev() {
            let region = &self.regions[r];
            let act = region.activation();
            delta.zip_mut_with(&cache.pre_activations[r], |d, &z| *d *= act.derivative(z));

            let x = &cache.inputs[r];
            let routed = &cache.rows[r];

            copy_grads[r] = routed
                .iter()
                .map(|copy_rows| {
                    if copy_rows.is_empty() {
                        Linear::zeros(region.input_size(), region.output_size())
                    } else {
                        let xs = x.select(Axis(0), copy_rows);
                        let ds = delta.select(Axis(0), copy_rows);
                        Linear::gradient(xs.view(), ds.view())
                    }
                })
                .collect();

            for (task, rows) in task_rows.iter().enumerate() {
                let g = if rows.is_empty() {
                    ndarray::Array1::zeros(region.copy_size())
                } else {
                    let xs = x.select(Axis(0), rows);
                    let ds = delta.select(Axis(0), rows);
                    Linear::gradient(xs.view(), ds.view()).flatten()
                };
                task_grads[task].push(g);
            }

            if r > 0 {
                let mut d_prev = Array2::zeros((delta.nrows(), region.input_size()));
                for (copy, copy_rows) in routed.iter().enumerate() {
                    if copy_rows.is_empty() {
                        continue;
                    }
                    let ds = delta.select(Axis(0), copy_rows);
                    let back = ds.dot(&region.copies()[copy].weight);
                    for (k, &row) in copy_rows.iter().enumerate() {
                        d_prev.row_mut(row).assign(&back.row(k));
                    }
                }
                delta = d_prev;
            }
        }

        for row in &mut task_grads {
            row.reverse();
        }

        Ok(NetworkGradients {
            copies: copy_grads,
            tasks: TaskGradients::new(task_grads, present)?,
        })
    }

    /// Clones copy `copy` of `region` into a new copy and moves every task in
    /// `group2` onto it; `group1` stays put. Returns the new copy's index.
    ///
    /// The groups must partition the tasks currently on that copy and both
    /// must be non-empty. On error nothing is modified.
    pub fn split(&mut self, region: usize, copy: usize, group1: &[usize], group2: &[usize]) -> Result<usize> {
        self.assignment.validate_split(region, copy, group1, group2)?;
        let new_copy = self.regions[region].duplicate(copy);
        let assigned = self.assignment.apply_split(region, group2);
        debug_assert_eq!(new_copy, assigned);
        self.version += 1;
        tracing::debug!(
            region,
            copy,
            new_copy,
            group1 = ?group1,
            group2 = ?group2,
            "split region copy"
        );
        Ok(new_copy)
    }
}
