//! Gradient containers produced by the backward pass and consumed by the
//! optimizer and the split statistics.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitError};
use crate::region::Linear;

/// Per (task, region) flattened gradients for one training step.
///
/// All tasks' vectors for a region share one length and layout (weights
/// row-major, then biases), so any two of them can be compared directly.
/// Tasks that had no rows in the step's batch are marked absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGradients {
    /// `grads[task][region]`
    grads: Vec<Vec<Array1<f64>>>,
    present: Vec<bool>,
}

impl TaskGradients {
    pub fn new(grads: Vec<Vec<Array1<f64>>>, present: Vec<bool>) -> Result<Self> {
        if grads.len() != present.len() {
            return Err(SplitError::shape("task presence mask", grads.len(), present.len()));
        }
        if let Some(first) = grads.first() {
            for (task, row) in grads.iter().enumerate().skip(1) {
                if row.len() != first.len() {
                    return Err(SplitError::shape(
                        "regions per task gradient",
                        first.len(),
                        format!("{} (task {task})", row.len()),
                    ));
                }
                for (region, (g, g0)) in row.iter().zip(first).enumerate() {
                    if g.len() != g0.len() {
                        return Err(SplitError::shape(
                            "region gradient length",
                            g0.len(),
                            format!("{} (task {task}, region {region})", g.len()),
                        ));
                    }
                }
            }
        }
        Ok(TaskGradients { grads, present })
    }

    /// Every task present.
    pub fn from_dense(grads: Vec<Vec<Array1<f64>>>) -> Result<Self> {
        let present = vec![true; grads.len()];
        Self::new(grads, present)
    }

    pub fn num_tasks(&self) -> usize {
        self.grads.len()
    }

    pub fn num_regions(&self) -> usize {
        self.grads.first().map_or(0, |row| row.len())
    }

    pub fn get(&self, task: usize, region: usize) -> Option<&Array1<f64>> {
        self.grads.get(task).and_then(|row| row.get(region))
    }

    pub fn is_present(&self, task: usize) -> bool {
        self.present.get(task).copied().unwrap_or(false)
    }

    /// Squared Euclidean distance between two tasks' gradients at `region`.
    pub fn squared_distance(&self, region: usize, a: usize, b: usize) -> Option<f64> {
        let ga = self.get(a, region)?;
        let gb = self.get(b, region)?;
        Some(ga.iter().zip(gb).map(|(x, y)| (x - y) * (x - y)).sum())
    }
}

/// Everything the backward pass produces for one batch.
#[derive(Debug, Clone)]
pub struct NetworkGradients {
    /// `copies[region][copy]`, summed over the rows routed through that copy.
    pub copies: Vec<Vec<Linear>>,
    pub tasks: TaskGradients,
}

impl NetworkGradients {
    pub fn global_norm(&self) -> f64 {
        self.copies
            .iter()
            .flatten()
            .map(|g| g.norm_sq())
            .sum::<f64>()
            .sqrt()
    }
}
