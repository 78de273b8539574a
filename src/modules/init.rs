//! Named layer traversal and weight initialization
//!
//! Every module exposes its parameterised layers through [`VisitLayers`] as a
//! [`LayerKind`] tagged with its dotted checkpoint path (for example
//! `blocks.3.temporal_attn.qkv`). Weight init and checkpoint loading are both
//! visitors over that traversal.

use burn::module::Param;
use burn::nn::Linear;
use burn::prelude::*;
use burn::tensor::Distribution;

use super::embeddings::PatchEmbed;
use super::normalization::LayerNorm;

/// A parameterised layer, borrowed mutably from the module tree
pub enum LayerKind<'a, B: Backend> {
    /// Fully connected layer (`.weight`, `.bias`)
    Linear(&'a mut Linear<B>),
    /// Layer normalization (`.weight`, `.bias`)
    Norm(&'a mut LayerNorm<B>),
    /// Patchify convolution (`.weight`, `.bias`)
    PatchProjection(&'a mut PatchEmbed<B>),
    /// Bare learned tensor such as `pos_embed`
    Embedding(&'a mut Param<Tensor<B, 3>>),
}

/// Receives every layer of a module tree
pub trait LayerVisitor<B: Backend> {
    fn visit(&mut self, path: &str, layer: LayerKind<'_, B>);
}

/// Modules whose layers can be walked with a [`LayerVisitor`]
pub trait VisitLayers<B: Backend> {
    fn visit_layers<V: LayerVisitor<B>>(&mut self, prefix: &str, visitor: &mut V);
}

/// Join a parent path and a child name with a dot
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Redraw rounds in [`trunc_normal`]
const TRUNC_REDRAWS: usize = 16;

/// Normal samples truncated to `[-2, 2]`
///
/// Values outside the bounds are redrawn from the same normal. Whatever is
/// still outside after [`TRUNC_REDRAWS`] rounds is clamped, which only
/// happens when `std` is large against the bounds.
pub fn trunc_normal<B: Backend, const D: usize>(
    shape: [usize; D],
    std: f64,
    device: &B::Device,
) -> Tensor<B, D> {
    let mut samples = Tensor::random(shape, Distribution::Normal(0.0, std), device);
    for _ in 0..TRUNC_REDRAWS {
        let outside = samples.clone().abs().greater_elem(2.0);
        let redraw = Tensor::random(shape, Distribution::Normal(0.0, std), device);
        samples = samples.mask_where(outside, redraw);
    }
    samples.clamp(-2.0, 2.0)
}

/// Transformer initialization: truncated-normal linear weights (std 0.02)
/// with zero bias, unit norm scale with zero shift. Patch projections and
/// embeddings keep their construction-time values.
#[derive(Debug, Clone)]
pub struct WeightInit {
    /// Standard deviation of linear weights
    pub std: f64,
    /// Number of linear layers reinitialized
    pub linears: usize,
    /// Number of norm layers reset
    pub norms: usize,
}

impl Default for WeightInit {
    fn default() -> Self {
        Self {
            std: 0.02,
            linears: 0,
            norms: 0,
        }
    }
}

impl<B: Backend> LayerVisitor<B> for WeightInit {
    fn visit(&mut self, _path: &str, layer: LayerKind<'_, B>) {
        match layer {
            LayerKind::Linear(linear) => {
                let weight = linear.weight.val();
                let device = weight.device();
                linear.weight = Param::from_tensor(trunc_normal(weight.dims(), self.std, &device));
                if let Some(bias) = &linear.bias {
                    let dims = bias.val().dims();
                    linear.bias = Some(Param::from_tensor(Tensor::zeros(dims, &device)));
                }
                self.linears += 1;
            }
            LayerKind::Norm(norm) => {
                norm.reset();
                self.norms += 1;
            }
            LayerKind::PatchProjection(_) | LayerKind::Embedding(_) => {}
        }
    }
}

/// Zero a linear layer's weight and bias
pub fn zero_linear<B: Backend>(linear: &mut Linear<B>) {
    let weight = linear.weight.val();
    let device = weight.device();
    linear.weight = Param::from_tensor(Tensor::zeros(weight.dims(), &device));
    if let Some(bias) = &linear.bias {
        let dims = bias.val().dims();
        linear.bias = Some(Param::from_tensor(Tensor::zeros(dims, &device)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::nn::LinearConfig;

    type TestBackend = NdArray<f32>;

    #[test]
    fn join_builds_dotted_paths() {
        assert_eq!(join("", "norm"), "norm");
        assert_eq!(join("blocks.0", "attn"), "blocks.0.attn");
    }

    #[test]
    fn trunc_normal_stays_in_bounds() {
        let device = NdArrayDevice::default();
        let t = trunc_normal::<TestBackend, 2>([64, 64], 5.0, &device);
        let max = t.clone().abs().max().into_scalar();
        assert!(max <= 2.0);
    }

    #[test]
    fn trunc_normal_redraws_instead_of_piling_on_bounds() {
        let device = NdArrayDevice::default();
        let t = trunc_normal::<TestBackend, 2>([64, 64], 1.0, &device);
        // Clamping alone would leave about 4.5% of the samples on +-2
        let on_bounds = t.clone().abs().equal_elem(2.0).int().sum().into_scalar();
        assert_eq!(on_bounds, 0);
        // Truncated unit normal has std ~0.88
        let std = t.powf_scalar(2.0).mean().sqrt().into_scalar();
        assert!((std - 0.88).abs() < 0.05, "{std}");
    }

    #[test]
    fn weight_init_resets_linear_and_norm() {
        let device = NdArrayDevice::default();
        let mut linear = LinearConfig::new(32, 16).init::<TestBackend>(&device);
        let mut norm = LayerNorm::<TestBackend>::new(8, 1e-6, &device);
        norm.bias = Param::from_tensor(Tensor::ones([8], &device));

        let mut init = WeightInit::default();
        init.visit("fc", LayerKind::Linear(&mut linear));
        init.visit("norm", LayerKind::Norm(&mut norm));
        assert_eq!(init.linears, 1);
        assert_eq!(init.norms, 1);

        let bias = linear.bias.as_ref().unwrap().val();
        assert_eq!(bias.abs().sum().into_scalar(), 0.0);
        let std = linear.weight.val().var(0).mean().sqrt().into_scalar();
        assert!(std > 0.01 && std < 0.03, "std {std}");
        assert_eq!(norm.bias.val().abs().sum().into_scalar(), 0.0);
    }

    #[test]
    fn zero_linear_clears_parameters() {
        let device = NdArrayDevice::default();
        let mut linear = LinearConfig::new(4, 4).init::<TestBackend>(&device);
        zero_linear(&mut linear);
        assert_eq!(linear.weight.val().abs().sum().into_scalar(), 0.0);
        assert_eq!(linear.bias.as_ref().unwrap().val().abs().sum().into_scalar(), 0.0);
    }
}
