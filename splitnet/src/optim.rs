//! Adam over the network's parameter copies.
//!
//! Moments are kept per (region, copy) in the same `Linear` layout as the
//! parameters. When a copy splits, the new copy inherits the parent's
//! moments, so both continue from the same optimizer state.

use ndarray::{Array, Dimension, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitError};
use crate::gradients::NetworkGradients;
use crate::network::SplittingNetwork;
use crate::region::Linear;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Global gradient norm clip; `None` disables clipping.
    pub max_grad_norm: Option<f64>,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            lr: 3e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-5,
            max_grad_norm: Some(0.5),
        }
    }
}

impl AdamConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.lr > 0.0) {
            return Err(SplitError::InvalidConfig(format!("lr must be positive, got {}", self.lr)));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(SplitError::InvalidConfig(format!("{name} must lie in [0, 1), got {beta}")));
            }
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm > 0.0) {
                return Err(SplitError::InvalidConfig(format!(
                    "max_grad_norm must be positive, got {norm}"
                )));
            }
        }
        Ok(())
    }
}

// ─── Moments ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Moments {
    m: Linear,
    v: Linear,
}

impl Moments {
    fn zeros_like(params: &Linear) -> Self {
        let zero = Linear::zeros(params.input_size(), params.output_size());
        Moments { m: zero.clone(), v: zero }
    }
}

/// Bias-corrected step coefficients for one Adam iteration.
struct StepCoeffs {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    bias_correction1: f64,
    bias_correction2: f64,
    grad_scale: f64,
}

fn adam_update<D: Dimension>(
    param: &mut Array<f64, D>,
    m: &mut Array<f64, D>,
    v: &mut Array<f64, D>,
    grad: &Array<f64, D>,
    c: &StepCoeffs,
) {
    Zip::from(param).and(m).and(v).and(grad).for_each(|p, m, v, &g| {
        let g = g * c.grad_scale;
        *m = c.beta1 * *m + (1.0 - c.beta1) * g;
        *v = c.beta2 * *v + (1.0 - c.beta2) * g * g;
        let m_hat = *m / c.bias_correction1;
        let v_hat = *v / c.bias_correction2;
        *p -= c.lr * m_hat / (v_hat.sqrt() + c.eps);
    });
}

// ─── Optimizer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    config: AdamConfig,
    t: u64,
    /// `moments[region][copy]`
    moments: Vec<Vec<Moments>>,
}

impl Adam {
    pub fn new(network: &SplittingNetwork, config: AdamConfig) -> Result<Self> {
        config.validate()?;
        let moments = network
            .regions()
            .iter()
            .map(|r| r.copies().iter().map(Moments::zeros_like).collect())
            .collect();
        Ok(Adam { config, t: 0, moments })
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn num_steps(&self) -> u64 {
        self.t
    }

    /// Gives `new_copy` of `region` the moments of `copy`.
    pub fn on_split(&mut self, region: usize, copy: usize, new_copy: usize) -> Result<()> {
        let num_regions = self.moments.len();
        let copies = self
            .moments
            .get_mut(region)
            .ok_or(SplitError::UnknownRegion { region, num_regions })?;
        let parent = copies.get(copy).cloned().ok_or(SplitError::UnknownCopy {
            region,
            copy,
            num_copies: copies.len(),
        })?;
        if new_copy < copies.len() {
            copies[new_copy] = parent;
        } else if new_copy == copies.len() {
            copies.push(parent);
        } else {
            return Err(SplitError::UnknownCopy {
                region,
                copy: new_copy,
                num_copies: copies.len(),
            });
        }
        Ok(())
    }

    /// Rejects moments that do not fit `network`. Missing trailing copies are
    /// allowed and start from zero on the next step.
    pub fn check_network(&self, network: &SplittingNetwork) -> Result<()> {
        if self.moments.len() != network.num_regions() {
            return Err(SplitError::InvalidConfig(format!(
                "optimizer has moments for {} regions, network has {}",
                self.moments.len(),
                network.num_regions()
            )));
        }
        for (r, (moments, region)) in self.moments.iter().zip(network.regions()).enumerate() {
            if moments.len() > region.num_copies() {
                return Err(SplitError::InvalidConfig(format!(
                    "optimizer has moments for {} copies of region {r}, network has {}",
                    moments.len(),
                    region.num_copies()
                )));
            }
            let fits = moments.iter().zip(region.copies()).all(|(mo, p)| {
                [&mo.m, &mo.v]
                    .iter()
                    .all(|l| l.weight.dim() == p.weight.dim() && l.bias.len() == p.bias.len())
            });
            if !fits {
                return Err(SplitError::InvalidConfig(format!(
                    "optimizer moment shapes do not match region {r}"
                )));
            }
        }
        Ok(())
    }

    /// Copies this optimizer has never seen start from zero moments.
    fn sync(&mut self, network: &SplittingNetwork) -> Result<()> {
        if self.moments.len() != network.num_regions() {
            return Err(SplitError::shape("optimizer regions", self.moments.len(), network.num_regions()));
        }
        for (moments, region) in self.moments.iter_mut().zip(network.regions()) {
            for params in &region.copies()[moments.len().min(region.num_copies())..] {
                moments.push(Moments::zeros_like(params));
            }
        }
        Ok(())
    }

    /// Applies one update and returns the gradient norm before clipping.
    pub fn step(&mut self, network: &mut SplittingNetwork, grads: &NetworkGradients) -> Result<f64> {
        self.sync(network)?;
        if grads.copies.len() != network.num_regions() {
            return Err(SplitError::shape("gradient regions", network.num_regions(), grads.copies.len()));
        }
        for (r, (copies, region)) in grads.copies.iter().zip(network.regions()).enumerate() {
            if copies.len() != region.num_copies() {
                return Err(SplitError::shape(
                    "gradient copies",
                    region.num_copies(),
                    format!("{} (region {r})", copies.len()),
                ));
            }
            for (g, p) in copies.iter().zip(region.copies()) {
                if g.weight.dim() != p.weight.dim() || g.bias.len() != p.bias.len() {
                    return Err(SplitError::shape(
                        "copy gradient",
                        format!("{:?}", p.weight.dim()),
                        format!("{:?} (region {r})", g.weight.dim()),
                    ));
                }
            }
        }

        let norm = grads.global_norm();
        let grad_scale = match self.config.max_grad_norm {
            Some(max) if norm > max => max / norm,
            _ => 1.0,
        };

        self.t += 1;
        let coeffs = StepCoeffs {
            lr: self.config.lr,
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            eps: self.config.eps,
            bias_correction1: 1.0 - self.config.beta1.powf(self.t as f64),
            bias_correction2: 1.0 - self.config.beta2.powf(self.t as f64),
            grad_scale,
        };

        for handle in network.copy_handles() {
            let g = &grads.copies[handle.region][handle.copy];
            let mo = &mut self.moments[handle.region][handle.copy];
            let p = network.parameters_mut(handle)?;
            adam_update(&mut p.weight, &mut mo.m.weight, &mut mo.v.weight, &g.weight, &coeffs);
            adam_update(&mut p.bias, &mut mo.m.bias, &mut mo.v.bias, &g.bias, &coeffs);
        }
        Ok(norm)
    }
}
