//! Stochastic depth
//!
//! During training each sample's residual branch is dropped with probability
//! `prob` and the survivors are rescaled by `1 / (1 - prob)`. Outside of
//! training (non-autodiff backends) the branch passes through untouched.

use burn::module::Module;
use burn::prelude::*;
use burn::tensor::Distribution;

/// Per-sample residual branch dropout
#[derive(Module, Clone, Debug)]
pub struct DropPath {
    /// Probability of dropping a sample's branch
    prob: f64,
}

impl DropPath {
    /// Create a drop-path layer; `prob == 0` makes it an identity
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    /// Drop probability
    pub fn prob(&self) -> f64 {
        self.prob
    }

    /// Apply to a `[batch, ...]` residual branch
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.prob == 0.0 {
            return x;
        }

        let keep = 1.0 - self.prob;
        let mut shape = [1; D];
        shape[0] = x.dims()[0];
        let mask = Tensor::<B, D>::random(shape, Distribution::Bernoulli(keep), &x.device());

        x * mask / keep
    }
}
