//! Running estimates of the mean (and optionally variance) of fixed-shape tensors.
//!
//! The first `ema_threshold` updates are averaged exactly; after that the
//! estimate switches to an exponential moving average with decay `ema_alpha`.
//! Exact averaging is cheap and unbiased while the sample is small, and the EMA
//! afterwards tracks drift in the gradient distribution.

use ndarray::{ArrayD, ArrayViewD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitError};

/// Number of exact-average steps and EMA decay for a running estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub ema_threshold: u64,
    pub ema_alpha: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            ema_threshold: 100,
            ema_alpha: 0.99,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.ema_alpha) {
            return Err(SplitError::InvalidConfig(format!(
                "ema_alpha must lie in [0, 1), got {}",
                self.ema_alpha
            )));
        }
        Ok(())
    }

    /// One step of the running-mean recurrence, `n` being the count after this update.
    #[inline]
    pub fn step(&self, old: f64, value: f64, n: u64) -> f64 {
        if n <= self.ema_threshold {
            (old * (n - 1) as f64 + value) / n as f64
        } else {
            old * self.ema_alpha + value * (1.0 - self.ema_alpha)
        }
    }
}

fn check_shape(expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(SplitError::shape(
            "estimator update",
            format!("{expected:?}"),
            format!("{actual:?}"),
        ));
    }
    Ok(())
}

/// Running mean of a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    config: EstimatorConfig,
    num_steps: u64,
    mean: ArrayD<f64>,
}

impl RunningMean {
    pub fn new(shape: &[usize], config: EstimatorConfig) -> Self {
        RunningMean {
            config,
            num_steps: 0,
            mean: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn update(&mut self, value: ArrayViewD<'_, f64>) -> Result<()> {
        check_shape(self.mean.shape(), value.shape())?;
        self.num_steps += 1;
        let (cfg, n) = (self.config, self.num_steps);
        Zip::from(&mut self.mean)
            .and(&value)
            .for_each(|m, &v| *m = cfg.step(*m, v, n));
        Ok(())
    }

    pub fn mean(&self) -> &ArrayD<f64> {
        &self.mean
    }

    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }
}

/// Running mean and standard deviation of a tensor.
///
/// Tracks `E[X]` and `E[X^2]` with the same recurrence and derives
/// `Var[X] = E[X^2] - E[X]^2`. Cancellation can push that slightly below
/// zero, so it is clamped before the square root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningMeanStdev {
    config: EstimatorConfig,
    num_steps: u64,
    mean: ArrayD<f64>,
    square_mean: ArrayD<f64>,
}

impl RunningMeanStdev {
    pub fn new(shape: &[usize], config: EstimatorConfig) -> Self {
        RunningMeanStdev {
            config,
            num_steps: 0,
            mean: ArrayD::zeros(IxDyn(shape)),
            square_mean: ArrayD::zeros(IxDyn(shape)),
        }
    }

    /// A zero-dimensional estimator, used for the per-pair gradient distances.
    pub fn scalar(config: EstimatorConfig) -> Self {
        Self::new(&[], config)
    }

    pub fn update(&mut self, value: ArrayViewD<'_, f64>) -> Result<()> {
        check_shape(self.mean.shape(), value.shape())?;
        self.num_steps += 1;
        let (cfg, n) = (self.config, self.num_steps);
        Zip::from(&mut self.mean)
            .and(&mut self.square_mean)
            .and(&value)
            .for_each(|m, sq, &v| {
                *m = cfg.step(*m, v, n);
                *sq = cfg.step(*sq, v * v, n);
            });
        Ok(())
    }

    /// Update a zero-dimensional estimator without building an array.
    pub fn update_scalar(&mut self, value: f64) -> Result<()> {
        check_shape(self.mean.shape(), &[])?;
        self.num_steps += 1;
        let (cfg, n) = (self.config, self.num_steps);
        if let (Some(m), Some(sq)) = (self.mean.first_mut(), self.square_mean.first_mut()) {
            *m = cfg.step(*m, value, n);
            *sq = cfg.step(*sq, value * value, n);
        }
        Ok(())
    }

    pub fn mean(&self) -> &ArrayD<f64> {
        &self.mean
    }

    pub fn square_mean(&self) -> &ArrayD<f64> {
        &self.square_mean
    }

    pub fn variance(&self) -> ArrayD<f64> {
        Zip::from(&self.mean)
            .and(&self.square_mean)
            .map_collect(|&m, &sq| sq - m * m)
    }

    pub fn stdev(&self) -> ArrayD<f64> {
        self.variance().mapv(|v| v.max(0.0).sqrt())
    }

    pub fn scalar_mean(&self) -> f64 {
        self.mean.first().copied().unwrap_or(0.0)
    }

    pub fn scalar_stdev(&self) -> f64 {
        let m = self.scalar_mean();
        let sq = self.square_mean.first().copied().unwrap_or(0.0);
        (sq - m * m).max(0.0).sqrt()
    }

    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }
}
