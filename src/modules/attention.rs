//! Multi-head self-attention for TimeSformer
//!
//! The same module serves the temporal pass (sequences of T frame tokens per
//! spatial location) and the spatial pass (sequences of H*W + 1 tokens per
//! frame); only the batching done by the caller differs.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::TimeSformerConfig;

/// Configuration for [`Attention`]
#[derive(Config, Debug)]
pub struct AttentionConfig {
    /// Token width
    pub dim: usize,
    /// Number of attention heads
    #[config(default = 8)]
    pub num_heads: usize,
    /// Bias on the fused query/key/value projection
    #[config(default = false)]
    pub qkv_bias: bool,
    /// Attention scale override (default: head_dim^-0.5)
    pub qk_scale: Option<f64>,
    /// Dropout on attention weights
    #[config(default = 0.0)]
    pub attn_drop: f64,
    /// Dropout after the output projection
    #[config(default = 0.0)]
    pub proj_drop: f64,
    /// Learned query/key/value and output projections
    #[config(default = true)]
    pub with_qkv: bool,
}

impl AttentionConfig {
    /// Attention settings shared by every block of a model
    pub fn from_model(config: &TimeSformerConfig) -> Self {
        Self::new(config.embed_dim)
            .with_num_heads(config.num_heads)
            .with_qkv_bias(config.qkv_bias)
            .with_qk_scale(config.qk_scale)
            .with_attn_drop(config.attn_drop_rate)
            .with_proj_drop(config.drop_rate)
    }

    /// Initialize the attention module
    pub fn init<B: Backend>(&self, device: &B::Device) -> Attention<B> {
        let head_dim = self.dim / self.num_heads;
        let scale = self
            .qk_scale
            .unwrap_or_else(|| (head_dim as f64).powf(-0.5)) as f32;

        let (qkv, proj) = if self.with_qkv {
            (
                Some(
                    LinearConfig::new(self.dim, self.dim * 3)
                        .with_bias(self.qkv_bias)
                        .init(device),
                ),
                Some(LinearConfig::new(self.dim, self.dim).with_bias(true).init(device)),
            )
        } else {
            (None, None)
        };

        Attention {
            qkv,
            proj,
            attn_drop: DropoutConfig::new(self.attn_drop).init(),
            proj_drop: DropoutConfig::new(self.proj_drop).init(),
            num_heads: self.num_heads,
            head_dim,
            scale,
        }
    }
}

/// Scaled dot-product self-attention over `[batch, seq_len, dim]`
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    /// Fused query/key/value projection: qkv [dim, 3 * dim]
    pub qkv: Option<Linear<B>>,
    /// Output projection: proj [dim, dim]
    pub proj: Option<Linear<B>>,
    attn_drop: Dropout,
    proj_drop: Dropout,
    /// Number of attention heads
    num_heads: usize,
    /// Head dimension
    head_dim: usize,
    /// Scale factor for attention logits
    scale: f32,
}

impl<B: Backend> Attention<B> {
    /// Number of attention heads
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Scale applied to the attention logits
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Token sequences [batch, seq_len, dim]
    ///
    /// # Returns
    /// Attended tokens with the same shape as `x`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq_len, dim] = x.dims();

        // [batch, num_heads, seq_len, head_dim] each
        let (q, k, v) = match &self.qkv {
            Some(qkv) => {
                let qkv = qkv
                    .forward(x)
                    .reshape([batch, seq_len, 3, self.num_heads, self.head_dim])
                    .permute([2, 0, 3, 1, 4]);
                let shape = [batch, self.num_heads, seq_len, self.head_dim];
                let q = qkv.clone().slice([0..1]).reshape(shape);
                let k = qkv.clone().slice([1..2]).reshape(shape);
                let v = qkv.slice([2..3]).reshape(shape);
                (q, k, v)
            }
            None => {
                let heads = x
                    .reshape([batch, seq_len, self.num_heads, self.head_dim])
                    .swap_dims(1, 2);
                (heads.clone(), heads.clone(), heads)
            }
        };

        let attn = q.matmul(k.transpose()) * self.scale;
        let attn = softmax(attn, 3);
        let attn = self.attn_drop.forward(attn);

        let out = attn.matmul(v).swap_dims(1, 2).reshape([batch, seq_len, dim]);

        match &self.proj {
            Some(proj) => self.proj_drop.forward(proj.forward(out)),
            None => out,
        }
    }
}
