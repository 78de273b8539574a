//! TimeSformer vision transformer
//!
//! Patch embedding, class token, positional and temporal embeddings, a stack
//! of space-time blocks and a linear classifier over the pooled class token.
//! Parameter paths match the original checkpoints (`pos_embed`,
//! `blocks.N.temporal_attn.qkv`, `head`, ...).

use burn::module::{Ignored, Module, Param};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use tracing::{debug, info};

use super::block::Block;
use super::embeddings::{resize_pos_embed, resize_time_embed, PatchEmbed, ShapeError};
use super::init::{join, trunc_normal, LayerKind, LayerVisitor, VisitLayers, WeightInit};
use super::layout;
use super::normalization::LayerNorm;
use crate::{AttentionType, ConfigError, TimeSformerConfig};

/// TimeSformer video classifier
#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    /// Frame patchify projection: patch_embed.proj
    pub patch_embed: PatchEmbed<B>,
    /// Class token: cls_token [1, 1, dim]
    pub cls_token: Param<Tensor<B, 3>>,
    /// Spatial positions: pos_embed [1, H*W + 1, dim]
    pub pos_embed: Param<Tensor<B, 3>>,
    /// Frame positions: time_embed [1, T, dim] (absent for space-only)
    pub time_embed: Option<Param<Tensor<B, 3>>>,
    pos_drop: Dropout,
    time_drop: Dropout,
    /// Transformer blocks: blocks.0 .. blocks.{depth-1}
    pub blocks: Vec<Block<B>>,
    /// Final norm: norm
    pub norm: LayerNorm<B>,
    /// Classifier: head (absent when num_classes == 0)
    pub head: Option<Linear<B>>,
    /// Model configuration (not a module parameter)
    config: Ignored<TimeSformerConfig>,
}

impl<B: Backend> VisionTransformer<B> {
    /// Build and initialize the model from a validated config
    pub fn new(config: &TimeSformerConfig, device: &B::Device) -> Result<Self, ConfigError> {
        config.validate()?;
        let dim = config.embed_dim;

        let blocks = config
            .drop_path_rates()
            .into_iter()
            .map(|rate| Block::new(config, rate, device))
            .collect();

        let time_embed = config
            .attention_type
            .uses_time_embed()
            .then(|| Param::from_tensor(Tensor::zeros([1, config.num_frames, dim], device)));

        let mut model = Self {
            patch_embed: PatchEmbed::new(config, device),
            cls_token: Param::from_tensor(trunc_normal([1, 1, dim], 0.02, device)),
            pos_embed: Param::from_tensor(trunc_normal([1, config.num_patches() + 1, dim], 0.02, device)),
            time_embed,
            pos_drop: DropoutConfig::new(config.drop_rate).init(),
            time_drop: DropoutConfig::new(config.drop_rate).init(),
            blocks,
            norm: LayerNorm::new(dim, config.norm_eps, device),
            head: classifier(dim, config.num_classes, device),
            config: Ignored(config.clone()),
        };

        let mut init = WeightInit::default();
        model.visit_layers("", &mut init);

        // Temporal attention starts closed everywhere but the first block
        if config.attention_type == AttentionType::DividedSpaceTime {
            for block in model.blocks.iter_mut().skip(1) {
                block.zero_temporal_fc();
            }
        }

        info!(
            attention_type = %config.attention_type,
            depth = config.depth,
            embed_dim = dim,
            num_frames = config.num_frames,
            num_classes = config.num_classes,
            linears = init.linears,
            norms = init.norms,
            "initialized TimeSformer"
        );

        Ok(model)
    }

    /// Get model configuration
    pub fn config(&self) -> &TimeSformerConfig {
        &self.config.0
    }

    /// Classifier head, if any
    pub fn classifier(&self) -> Option<&Linear<B>> {
        self.head.as_ref()
    }

    /// Replace the classifier with a freshly initialized one
    pub fn reset_classifier(&mut self, num_classes: usize, device: &B::Device) {
        let mut head = classifier(self.config.0.embed_dim, num_classes, device);
        if let Some(linear) = head.as_mut() {
            let mut init = WeightInit::default();
            init.visit("head", LayerKind::Linear(linear));
        }
        self.head = head;
        self.config.0.num_classes = num_classes;
    }

    /// Parameters conventionally excluded from weight decay
    pub fn no_weight_decay(&self) -> Vec<&'static str> {
        let mut names = vec!["pos_embed", "cls_token"];
        if self.time_embed.is_some() {
            names.push("time_embed");
        }
        names
    }

    /// Pooled class-token features
    ///
    /// # Arguments
    /// * `x` - Video clip [batch, channels, time, height, width]
    ///
    /// # Returns
    /// Normalized class tokens [batch, embed_dim]
    pub fn forward_features(&self, x: Tensor<B, 5>) -> Tensor<B, 2> {
        let batch = x.dims()[0];
        let (tokens, frames, width) = self.patch_embed.forward(x);
        let [rows, num_patches, dim] = tokens.dims();
        let height = num_patches / width;

        // Prepend one class token per frame row
        let cls_tokens = self.cls_token.val().repeat(&[rows, 1, 1]);
        let x = Tensor::cat(vec![cls_tokens, tokens], 1);

        let x = x + self.positional_embedding(height, width).repeat(&[rows, 1, 1]);
        let x = self.pos_drop.forward(x);

        let x = match &self.time_embed {
            Some(time_embed) => {
                // The class token is identical for every frame of a clip; keep frame 0
                let cls = x
                    .clone()
                    .slice([0..rows, 0..1, 0..dim])
                    .reshape([batch, frames, 1, dim])
                    .slice([0..batch, 0..1, 0..1, 0..dim])
                    .reshape([batch, 1, dim]);
                let patches = x.slice([0..rows, 1..num_patches + 1, 0..dim]);

                // [B*T, N, C] -> [B*N, T, C]
                let patches = layout::frames_to_temporal(patches, batch);
                let patches = patches + self.temporal_embedding(time_embed, frames).repeat(&[batch * num_patches, 1, 1]);
                let patches = self.time_drop.forward(patches);

                // [B*N, T, C] -> [B, N*T, C]
                let patches = layout::from_temporal(patches, batch);
                Tensor::cat(vec![cls, patches], 1)
            }
            None => x,
        };

        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x, batch, frames, width);
        }

        // Space-only: average the per-frame sequences
        if self.config.0.attention_type == AttentionType::SpaceOnly {
            x = layout::mean_over_frames(x, batch);
        }

        let x = self.norm.forward(x);
        let [_, _, dim] = x.dims();
        x.slice([0..batch, 0..1, 0..dim]).reshape([batch, dim])
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Video clip [batch, channels, time, height, width]
    ///
    /// # Returns
    /// Class logits [batch, num_classes] (pooled features when the head is disabled)
    ///
    /// # Panics
    /// If the input shape is rejected by [`Self::check_input`].
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 2> {
        let features = self.forward_features(x);
        match &self.head {
            Some(head) => head.forward(features),
            None => features,
        }
    }

    /// Forward pass that validates the input shape first
    pub fn try_forward(&self, x: Tensor<B, 5>) -> Result<Tensor<B, 2>, ShapeError> {
        self.check_input(x.dims())?;
        Ok(self.forward(x))
    }

    /// Validate a `[batch, channels, time, height, width]` input shape
    pub fn check_input(&self, dims: [usize; 5]) -> Result<(), ShapeError> {
        self.patch_embed.check_input(dims)
    }

    /// Positional embedding for a `height x width` patch grid
    fn positional_embedding(&self, height: usize, width: usize) -> Tensor<B, 3> {
        let pos_embed = self.pos_embed.val();
        let stored = self.config.0.grid_size();
        if (height, width) == (stored, stored) {
            return pos_embed;
        }
        debug!(from = ?(stored, stored), to = ?(height, width), "resizing positional embedding");
        resize_pos_embed(pos_embed, (stored, stored), (height, width))
    }

    /// Temporal embedding for `frames` frames
    fn temporal_embedding(&self, time_embed: &Param<Tensor<B, 3>>, frames: usize) -> Tensor<B, 3> {
        let time_embed = time_embed.val();
        let stored = time_embed.dims()[1];
        if stored == frames {
            return time_embed;
        }
        debug!(from = stored, to = frames, "resizing temporal embedding");
        resize_time_embed(time_embed, frames)
    }
}

fn classifier<B: Backend>(dim: usize, num_classes: usize, device: &B::Device) -> Option<Linear<B>> {
    (num_classes > 0).then(|| LinearConfig::new(dim, num_classes).with_bias(true).init(device))
}

impl<B: Backend> VisitLayers<B> for VisionTransformer<B> {
    fn visit_layers<V: LayerVisitor<B>>(&mut self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "cls_token"), LayerKind::Embedding(&mut self.cls_token));
        visitor.visit(&join(prefix, "pos_embed"), LayerKind::Embedding(&mut self.pos_embed));
        if let Some(time_embed) = self.time_embed.as_mut() {
            visitor.visit(&join(prefix, "time_embed"), LayerKind::Embedding(time_embed));
        }
        visitor.visit(
            &join(prefix, "patch_embed.proj"),
            LayerKind::PatchProjection(&mut self.patch_embed),
        );
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.visit_layers(&join(prefix, &format!("blocks.{i}")), visitor);
        }
        visitor.visit(&join(prefix, "norm"), LayerKind::Norm(&mut self.norm));
        if let Some(head) = self.head.as_mut() {
            visitor.visit(&join(prefix, "head"), LayerKind::Linear(head));
        }
    }
}

impl TimeSformerConfig {
    /// Initialize the model
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<VisionTransformer<B>, ConfigError> {
        VisionTransformer::new(self, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn tiny(attention_type: AttentionType) -> TimeSformerConfig {
        TimeSformerConfig::new()
            .with_img_size(8)
            .with_patch_size(4)
            .with_embed_dim(8)
            .with_depth(3)
            .with_num_heads(2)
            .with_num_classes(5)
            .with_num_frames(3)
            .with_attention_type(attention_type)
    }

    #[test]
    fn temporal_gate_is_zero_after_the_first_block() {
        let device = NdArrayDevice::default();
        let model = tiny(AttentionType::DividedSpaceTime).init::<TestBackend>(&device).unwrap();

        let gate_norm = |block: &Block<TestBackend>| {
            let fc = &block.temporal.as_ref().unwrap().fc;
            let weight = fc.weight.val().abs().sum().into_scalar();
            let bias = fc.bias.as_ref().unwrap().val().abs().sum().into_scalar();
            weight + bias
        };

        assert!(gate_norm(&model.blocks[0]) > 0.0);
        for block in &model.blocks[1..] {
            assert_eq!(gate_norm(block), 0.0);
        }
    }

    #[test]
    fn forward_shapes_for_every_attention_type() {
        let device = NdArrayDevice::default();
        for kind in AttentionType::ALL {
            let model = tiny(kind).init::<TestBackend>(&device).unwrap();
            let x = Tensor::random([2, 3, 3, 8, 8], Distribution::Default, &device);
            assert_eq!(model.forward(x).dims(), [2, 5], "{kind}");
        }
    }

    #[test]
    fn embeddings_resize_for_other_inputs() {
        let device = NdArrayDevice::default();
        let model = tiny(AttentionType::DividedSpaceTime).init::<TestBackend>(&device).unwrap();
        // 12x16 frames and 5 frames differ from the 8x8, 3-frame config
        let x = Tensor::random([1, 3, 5, 12, 16], Distribution::Default, &device);
        assert_eq!(model.forward(x).dims(), [1, 5]);
    }

    #[test]
    fn space_only_has_no_time_embed() {
        let device = NdArrayDevice::default();
        let model = tiny(AttentionType::SpaceOnly).init::<TestBackend>(&device).unwrap();
        assert!(model.time_embed.is_none());
        assert_eq!(model.no_weight_decay(), vec!["pos_embed", "cls_token"]);
    }

    #[test]
    fn headless_model_returns_features() {
        let device = NdArrayDevice::default();
        let mut model = tiny(AttentionType::JointSpaceTime)
            .with_num_classes(0)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(model.classifier().is_none());

        let x = Tensor::<TestBackend, 5>::random([2, 3, 3, 8, 8], Distribution::Default, &device);
        assert_eq!(model.forward(x.clone()).dims(), [2, 8]);

        model.reset_classifier(7, &device);
        assert_eq!(model.config().num_classes, 7);
        assert_eq!(model.forward(x).dims(), [2, 7]);
    }

    #[test]
    fn try_forward_rejects_bad_frames() {
        let device = NdArrayDevice::default();
        let model = tiny(AttentionType::DividedSpaceTime).init::<TestBackend>(&device).unwrap();
        let x = Tensor::zeros([1, 3, 2, 10, 8], &device);
        assert!(matches!(model.try_forward(x), Err(ShapeError::NotDivisible { .. })));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let device = NdArrayDevice::default();
        let err = tiny(AttentionType::DividedSpaceTime)
            .with_img_size(10)
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert_eq!(err, ConfigError::PatchSizeMismatch { img_size: 10, patch_size: 4 });
    }

    #[test]
    fn num_params_matches_config() {
        let device = NdArrayDevice::default();
        for kind in AttentionType::ALL {
            let config = tiny(kind);
            let model = config.init::<TestBackend>(&device).unwrap();
            assert_eq!(model.num_params(), config.num_params(), "{kind}");
        }
    }
}
