//! Position-wise feed-forward network for TimeSformer
//!
//! Mlp(x) = drop(fc2(drop(GELU(fc1(x)))))
//!
//! Matches checkpoint naming: mlp.fc1, mlp.fc2

use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::gelu;

use crate::TimeSformerConfig;

/// Two-layer GELU feed-forward network
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    /// Up projection: mlp.fc1 [dim, hidden]
    pub fc1: Linear<B>,
    /// Down projection: mlp.fc2 [hidden, dim]
    pub fc2: Linear<B>,
    drop: Dropout,
}

impl<B: Backend> Mlp<B> {
    /// Create a feed-forward network with an explicit hidden width
    pub fn new(dim: usize, hidden: usize, drop: f64, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(dim, hidden).with_bias(true).init(device),
            fc2: LinearConfig::new(hidden, dim).with_bias(true).init(device),
            drop: DropoutConfig::new(drop).init(),
        }
    }

    /// Create the block feed-forward network (hidden = dim * mlp_ratio)
    pub fn from_model(config: &TimeSformerConfig, device: &B::Device) -> Self {
        Self::new(config.embed_dim, config.mlp_hidden_dim(), config.drop_rate, device)
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = gelu(self.fc1.forward(x));
        let x = self.drop.forward(x);
        let x = self.fc2.forward(x);
        self.drop.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::tensor::Distribution;

    #[test]
    fn preserves_shape_with_default_ratio() {
        let device = NdArrayDevice::default();
        let config = TimeSformerConfig::new().with_embed_dim(16).with_num_heads(4);
        let mlp = Mlp::<NdArray<f32>>::from_model(&config, &device);
        assert_eq!(mlp.fc1.weight.val().dims(), [16, 64]);

        let x = Tensor::random([2, 5, 16], Distribution::Default, &device);
        assert_eq!(mlp.forward(x).dims(), [2, 5, 16]);
    }
}
