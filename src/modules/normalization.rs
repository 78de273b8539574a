//! Layer normalization for TimeSformer
//!
//! Parameters are named `weight` and `bias` so that checkpoint keys such as
//! `blocks.3.norm1.weight` map onto the module tree one to one.

use burn::module::{Ignored, Module, Param};
use burn::prelude::*;

/// Layer Normalization over the last (channel) axis
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    /// Scale parameter (gamma)
    pub weight: Param<Tensor<B, 1>>,
    /// Shift parameter (beta)
    pub bias: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    eps: Ignored<f64>,
}

impl<B: Backend> LayerNorm<B> {
    /// Create a new layer normalization with unit scale and zero shift
    pub fn new(size: usize, eps: f64, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([size], device)),
            bias: Param::from_tensor(Tensor::zeros([size], device)),
            eps: Ignored(eps),
        }
    }

    /// Normalized width
    pub fn size(&self) -> usize {
        self.weight.val().dims()[0]
    }

    /// Reset to unit scale and zero shift
    pub fn reset(&mut self) {
        let device = self.weight.val().device();
        let size = self.size();
        self.weight = Param::from_tensor(Tensor::ones([size], &device));
        self.bias = Param::from_tensor(Tensor::zeros([size], &device));
    }

    /// Normalize `[..., channels]`
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let dim = D - 1;
        let mean = x.clone().mean_dim(dim);
        let centered = x - mean;
        let variance = centered.clone().powf_scalar(2.0).mean_dim(dim);
        let x_norm = centered / (variance + self.eps.0).sqrt();
        x_norm * self.weight.val().unsqueeze::<D>() + self.bias.val().unsqueeze::<D>()
    }
}
