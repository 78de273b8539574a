//! Divided space-time transformer block
//!
//! For `divided_space_time` a block runs temporal attention (each spatial
//! location attends over its T frames), gates it through `temporal_fc`, then
//! runs spatial attention (each frame attends over its H*W patches plus a copy
//! of the class token) and finishes with the feed-forward network. The other
//! attention types are a plain pre-norm transformer block; how time is
//! batched is decided by the caller.

use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use super::attention::{Attention, AttentionConfig};
use super::drop_path::DropPath;
use super::feed_forward::Mlp;
use super::init::{join, zero_linear, LayerKind, LayerVisitor, VisitLayers};
use super::layout;
use super::normalization::LayerNorm;
use crate::{AttentionType, TimeSformerConfig};

/// Temporal branch of a divided space-time block
#[derive(Module, Debug)]
pub struct TemporalBranch<B: Backend> {
    /// Pre-norm: temporal_norm1
    pub norm: LayerNorm<B>,
    /// Attention across frames: temporal_attn
    pub attn: Attention<B>,
    /// Residual gate: temporal_fc [dim, dim]
    pub fc: Linear<B>,
}

/// TimeSformer block
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    /// Pre-norm for spatial (or joint) attention: norm1
    pub norm1: LayerNorm<B>,
    /// Spatial (or joint) attention: attn
    pub attn: Attention<B>,
    /// Present only for divided space-time attention
    pub temporal: Option<TemporalBranch<B>>,
    /// Pre-norm for the feed-forward network: norm2
    pub norm2: LayerNorm<B>,
    /// Feed-forward network: mlp
    pub mlp: Mlp<B>,
    drop_path: DropPath,
    attention_type: Ignored<AttentionType>,
}

impl<B: Backend> Block<B> {
    /// Create a block with the given stochastic depth rate
    pub fn new(config: &TimeSformerConfig, drop_path: f64, device: &B::Device) -> Self {
        let dim = config.embed_dim;
        let attn_config = AttentionConfig::from_model(config);

        let temporal = match config.attention_type {
            AttentionType::DividedSpaceTime => Some(TemporalBranch {
                norm: LayerNorm::new(dim, config.norm_eps, device),
                attn: attn_config.init(device),
                fc: LinearConfig::new(dim, dim).with_bias(true).init(device),
            }),
            AttentionType::SpaceOnly | AttentionType::JointSpaceTime => None,
        };

        Self {
            norm1: LayerNorm::new(dim, config.norm_eps, device),
            attn: attn_config.init(device),
            temporal,
            norm2: LayerNorm::new(dim, config.norm_eps, device),
            mlp: Mlp::from_model(config, device),
            drop_path: DropPath::new(drop_path),
            attention_type: Ignored(config.attention_type),
        }
    }

    /// Attention scheme of this block
    pub fn attention_type(&self) -> AttentionType {
        self.attention_type.0
    }

    /// Stochastic depth rate
    pub fn drop_path_rate(&self) -> f64 {
        self.drop_path.prob()
    }

    /// Zero the temporal gate so the temporal branch contributes nothing
    pub fn zero_temporal_fc(&mut self) {
        if let Some(temporal) = self.temporal.as_mut() {
            zero_linear(&mut temporal.fc);
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Tokens [batch, 1 + H*W*T, dim] for divided and joint attention,
    ///   [batch * T, 1 + H*W, dim] for space-only
    /// * `batch` - Clips in the batch
    /// * `frames` - Frames per clip
    /// * `width` - Patch grid width
    pub fn forward(&self, x: Tensor<B, 3>, batch: usize, frames: usize, width: usize) -> Tensor<B, 3> {
        match &self.temporal {
            Some(temporal) => self.forward_divided(temporal, x, batch, frames, width),
            None => {
                let x = x.clone() + self.drop_path.forward(self.attn.forward(self.norm1.forward(x)));
                x.clone() + self.drop_path.forward(self.mlp.forward(self.norm2.forward(x)))
            }
        }
    }

    fn forward_divided(
        &self,
        temporal: &TemporalBranch<B>,
        x: Tensor<B, 3>,
        batch: usize,
        frames: usize,
        width: usize,
    ) -> Tensor<B, 3> {
        let [_, seq_len, dim] = x.dims();
        let num_tokens = seq_len - 1;
        let height = num_tokens / frames / width;
        let spatial = height * width;
        debug_assert_eq!(spatial * frames, num_tokens);

        let cls_token = x.clone().slice([0..batch, 0..1, 0..dim]);
        let patches = x.slice([0..batch, 1..seq_len, 0..dim]);

        // Temporal: [B, HWT, C] -> [B*HW, T, C]
        let xt = layout::to_temporal(patches.clone(), batch, frames);
        let res_temporal = self
            .drop_path
            .forward(temporal.attn.forward(temporal.norm.forward(xt)));
        let res_temporal = layout::from_temporal(res_temporal, batch);
        let res_temporal = temporal.fc.forward(res_temporal);
        let xt = patches + res_temporal;

        // Spatial: one class-token copy per frame, [B*T, 1 + HW, C]
        let cls_frames = cls_token
            .clone()
            .repeat(&[1, frames, 1])
            .reshape([batch * frames, 1, dim]);
        let xs = layout::to_spatial(xt.clone(), batch, frames);
        let xs = Tensor::cat(vec![cls_frames, xs], 1);
        let res_spatial = self.drop_path.forward(self.attn.forward(self.norm1.forward(xs)));

        // Average the per-frame class tokens back into one per clip
        let res_cls = res_spatial.clone().slice([0..batch * frames, 0..1, 0..dim]);
        let res_cls = layout::mean_over_frames(res_cls, batch);
        let res_patches = res_spatial.slice([0..batch * frames, 1..spatial + 1, 0..dim]);
        let res_patches = layout::from_spatial(res_patches, batch);

        let x = Tensor::cat(vec![cls_token, xt], 1) + Tensor::cat(vec![res_cls, res_patches], 1);

        x.clone() + self.drop_path.forward(self.mlp.forward(self.norm2.forward(x)))
    }
}

impl<B: Backend> VisitLayers<B> for Attention<B> {
    fn visit_layers<V: LayerVisitor<B>>(&mut self, prefix: &str, visitor: &mut V) {
        if let Some(qkv) = self.qkv.as_mut() {
            visitor.visit(&join(prefix, "qkv"), LayerKind::Linear(qkv));
        }
        if let Some(proj) = self.proj.as_mut() {
            visitor.visit(&join(prefix, "proj"), LayerKind::Linear(proj));
        }
    }
}

impl<B: Backend> VisitLayers<B> for Mlp<B> {
    fn visit_layers<V: LayerVisitor<B>>(&mut self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "fc1"), LayerKind::Linear(&mut self.fc1));
        visitor.visit(&join(prefix, "fc2"), LayerKind::Linear(&mut self.fc2));
    }
}

impl<B: Backend> VisitLayers<B> for Block<B> {
    fn visit_layers<V: LayerVisitor<B>>(&mut self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "norm1"), LayerKind::Norm(&mut self.norm1));
        self.attn.visit_layers(&join(prefix, "attn"), visitor);
        if let Some(temporal) = self.temporal.as_mut() {
            visitor.visit(&join(prefix, "temporal_norm1"), LayerKind::Norm(&mut temporal.norm));
            temporal.attn.visit_layers(&join(prefix, "temporal_attn"), visitor);
            visitor.visit(&join(prefix, "temporal_fc"), LayerKind::Linear(&mut temporal.fc));
        }
        visitor.visit(&join(prefix, "norm2"), LayerKind::Norm(&mut self.norm2));
        self.mlp.visit_layers(&join(prefix, "mlp"), visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::tensor::{Distribution, Tolerance};

    type TestBackend = NdArray<f32>;

    fn config(attention_type: AttentionType) -> TimeSformerConfig {
        TimeSformerConfig::new()
            .with_embed_dim(8)
            .with_num_heads(2)
            .with_attention_type(attention_type)
    }

    #[test]
    fn divided_block_preserves_shape() {
        let device = NdArrayDevice::default();
        let block = Block::<TestBackend>::new(&config(AttentionType::DividedSpaceTime), 0.0, &device);
        for (batch, height, width, frames) in [(1, 1, 1, 1), (2, 2, 3, 4), (3, 2, 2, 1)] {
            let len = 1 + height * width * frames;
            let x = Tensor::random([batch, len, 8], Distribution::Default, &device);
            assert_eq!(block.forward(x, batch, frames, width).dims(), [batch, len, 8]);
        }
    }

    #[test]
    fn only_divided_blocks_have_a_temporal_branch() {
        let device = NdArrayDevice::default();
        for kind in AttentionType::ALL {
            let block = Block::<TestBackend>::new(&config(kind), 0.0, &device);
            assert_eq!(block.temporal.is_some(), kind == AttentionType::DividedSpaceTime);
            assert_eq!(block.attention_type(), kind);
        }
    }

    #[test]
    fn zero_gate_reduces_to_spatial_attention() {
        let device = NdArrayDevice::default();
        let mut block = Block::<TestBackend>::new(&config(AttentionType::DividedSpaceTime), 0.0, &device);
        block.zero_temporal_fc();

        let (batch, height, width, frames, dim) = (2, 2, 2, 3, 8);
        let x = Tensor::<TestBackend, 3>::random(
            [batch, 1 + height * width * frames, dim],
            Distribution::Default,
            &device,
        );
        let out = block.forward(x.clone(), batch, frames, width);

        // With the gate closed the patches see only per-frame spatial attention
        let spatial = height * width;
        let cls = x.clone().slice([0..batch, 0..1, 0..dim]);
        let patches = x.slice([0..batch, 1..1 + spatial * frames, 0..dim]);
        let xs = Tensor::cat(
            vec![
                cls.clone().repeat(&[1, frames, 1]).reshape([batch * frames, 1, dim]),
                layout::to_spatial(patches.clone(), batch, frames),
            ],
            1,
        );
        let res = block.attn.forward(block.norm1.forward(xs));
        let res_cls = layout::mean_over_frames(res.clone().slice([0..batch * frames, 0..1, 0..dim]), batch);
        let res_patches = layout::from_spatial(res.slice([0..batch * frames, 1..1 + spatial, 0..dim]), batch);
        let expected = Tensor::cat(vec![cls, patches], 1) + Tensor::cat(vec![res_cls, res_patches], 1);
        let expected = expected.clone() + block.mlp.forward(block.norm2.forward(expected));

        out.to_data()
            .assert_approx_eq(&expected.to_data(), Tolerance::<f32>::absolute(1e-5));
    }

    #[test]
    fn visits_checkpoint_paths() {
        struct Paths(Vec<String>);
        impl<B: Backend> LayerVisitor<B> for Paths {
            fn visit(&mut self, path: &str, _layer: LayerKind<'_, B>) {
                self.0.push(path.to_string());
            }
        }

        let device = NdArrayDevice::default();
        let mut block = Block::<TestBackend>::new(&config(AttentionType::DividedSpaceTime), 0.0, &device);
        let mut paths = Paths(Vec::new());
        block.visit_layers("blocks.1", &mut paths);
        assert_eq!(
            paths.0,
            vec![
                "blocks.1.norm1",
                "blocks.1.attn.qkv",
                "blocks.1.attn.proj",
                "blocks.1.temporal_norm1",
                "blocks.1.temporal_attn.qkv",
                "blocks.1.temporal_attn.proj",
                "blocks.1.temporal_fc",
                "blocks.1.norm2",
                "blocks.1.mlp.fc1",
                "blocks.1.mlp.fc2",
            ]
        );
    }
}
