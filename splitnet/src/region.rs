//! One layer position of the splitting network and its parallel parameter copies.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Elementwise nonlinearity applied after a region's affine transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Tanh,
    Relu,
    Identity,
}

impl Activation {
    #[inline]
    pub fn apply(&self, z: f64) -> f64 {
        match self {
            Activation::Tanh => z.tanh(),
            Activation::Relu => z.max(0.0),
            Activation::Identity => z,
        }
    }

    /// Derivative evaluated at the pre-activation `z`.
    #[inline]
    pub fn derivative(&self, z: f64) -> f64 {
        match self {
            Activation::Tanh => {
                let t = z.tanh();
                1.0 - t * t
            }
            Activation::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Identity => 1.0,
        }
    }
}

/// Affine block `y = x W^T + b`, with `W` stored as (out, in).
///
/// The same struct doubles as the gradient container for a block, since the
/// gradient has exactly the parameter shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Linear {
    pub fn zeros(fan_in: usize, fan_out: usize) -> Self {
        Linear {
            weight: Array2::zeros((fan_out, fan_in)),
            bias: Array1::zeros(fan_out),
        }
    }

    /// Xavier-normal weights, zero biases.
    pub fn xavier<R: Rng>(fan_in: usize, fan_out: usize, rng: &mut R) -> Self {
        let std = (2.0 / (fan_in + fan_out) as f64).sqrt();
        let weight = Array2::from_shape_simple_fn((fan_out, fan_in), || {
            let z: f64 = rng.sample(StandardNormal);
            z * std
        });
        Linear {
            weight,
            bias: Array1::zeros(fan_out),
        }
    }

    pub fn input_size(&self) -> usize {
        self.weight.ncols()
    }

    pub fn output_size(&self) -> usize {
        self.weight.nrows()
    }

    pub fn num_params(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// Batched affine transform, one row per sample.
    pub fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// Weights (row-major) followed by biases.
    pub fn flatten(&self) -> Array1<f64> {
        self.weight.iter().chain(self.bias.iter()).copied().collect()
    }

    pub fn norm_sq(&self) -> f64 {
        self.weight.iter().chain(self.bias.iter()).map(|v| v * v).sum()
    }

    /// Gradient of a linear block given the block's inputs and the
    /// loss gradient at its pre-activation, summed over rows.
    pub fn gradient(x: ArrayView2<'_, f64>, delta: ArrayView2<'_, f64>) -> Self {
        Linear {
            weight: delta.t().dot(&x),
            bias: delta.sum_axis(Axis(0)),
        }
    }
}

/// One layer position: a dense list of parameter copies sharing shape and activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    activation: Activation,
    copies: Vec<Linear>,
}

impl Region {
    pub fn new<R: Rng>(
        fan_in: usize,
        fan_out: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        Region {
            activation,
            copies: vec![Linear::xavier(fan_in, fan_out, rng)],
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn num_copies(&self) -> usize {
        self.copies.len()
    }

    pub fn input_size(&self) -> usize {
        self.copies[0].input_size()
    }

    pub fn output_size(&self) -> usize {
        self.copies[0].output_size()
    }

    /// Parameter count of a single copy.
    pub fn copy_size(&self) -> usize {
        self.copies[0].num_params()
    }

    pub fn copy(&self, copy: usize) -> Option<&Linear> {
        self.copies.get(copy)
    }

    pub fn copy_mut(&mut self, copy: usize) -> Option<&mut Linear> {
        self.copies.get_mut(copy)
    }

    pub fn copies(&self) -> &[Linear] {
        &self.copies
    }

    /// Deep-copies `copy` into a new trailing copy and returns its index.
    /// The caller has already checked that `copy` exists.
    pub(crate) fn duplicate(&mut self, copy: usize) -> usize {
        let cloned = self.copies[copy].clone();
        self.copies.push(cloned);
        self.copies.len() - 1
    }
}
