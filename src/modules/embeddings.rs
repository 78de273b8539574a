//! Patch and position embeddings for TimeSformer
//!
//! Converts video frames into patch tokens and resizes the learned positional
//! and temporal embeddings when the input grid or clip length differs from
//! the one the model was built for.

use burn::module::{Module, Param};
use burn::prelude::*;
use burn::tensor::Distribution;
use thiserror::Error;

use crate::TimeSformerConfig;

/// Input video shape problems
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("frame size {height}x{width} is not divisible by patch size {patch_size}")]
    NotDivisible {
        height: usize,
        width: usize,
        patch_size: usize,
    },
    #[error("expected {expected} input channels, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("input has an empty dimension: {dims:?}")]
    Empty { dims: [usize; 5] },
}

/// Frame-wise patch embedding (matches checkpoint `patch_embed.proj`)
///
/// A 2D convolution with kernel = stride = patch size applied to every frame:
/// proj.weight [embed_dim, in_chans, patch, patch]. Computed as patch
/// extraction followed by one matrix multiply.
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    /// Convolution kernel: [embed_dim, in_chans, patch_size, patch_size]
    pub weight: Param<Tensor<B, 4>>,
    /// Bias: [embed_dim]
    pub bias: Param<Tensor<B, 1>>,
    /// Patch side in pixels
    patch_size: usize,
    /// Number of input channels
    in_chans: usize,
    /// Embedding width
    embed_dim: usize,
}

impl<B: Backend> PatchEmbed<B> {
    /// Create a patch embedding with the convolution default initialization
    pub fn new(config: &TimeSformerConfig, device: &B::Device) -> Self {
        let fan_in = config.in_chans * config.patch_size * config.patch_size;
        let bound = 1.0 / (fan_in as f64).sqrt();

        let weight = Tensor::random(
            [config.embed_dim, config.in_chans, config.patch_size, config.patch_size],
            Distribution::Uniform(-bound, bound),
            device,
        );
        let bias = Tensor::random([config.embed_dim], Distribution::Uniform(-bound, bound), device);

        Self {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(bias),
            patch_size: config.patch_size,
            in_chans: config.in_chans,
            embed_dim: config.embed_dim,
        }
    }

    /// Patch side in pixels
    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Validate a `[batch, channels, time, height, width]` input shape
    pub fn check_input(&self, dims: [usize; 5]) -> Result<(), ShapeError> {
        let [_batch, channels, _time, height, width] = dims;
        if dims.iter().any(|d| *d == 0) {
            return Err(ShapeError::Empty { dims });
        }
        if channels != self.in_chans {
            return Err(ShapeError::ChannelMismatch {
                expected: self.in_chans,
                actual: channels,
            });
        }
        if height % self.patch_size != 0 || width % self.patch_size != 0 {
            return Err(ShapeError::NotDivisible {
                height,
                width,
                patch_size: self.patch_size,
            });
        }
        Ok(())
    }

    /// Get the patch grid `(rows, cols)` for a frame size
    pub fn grid(&self, height: usize, width: usize) -> (usize, usize) {
        (height / self.patch_size, width / self.patch_size)
    }

    /// Convert frames to patch tokens
    ///
    /// # Arguments
    /// * `x` - Input video [batch, channels, time, height, width]
    ///
    /// # Returns
    /// Patch tokens [batch * time, rows * cols, embed_dim], the frame count
    /// and the patch grid width.
    pub fn forward(&self, x: Tensor<B, 5>) -> (Tensor<B, 3>, usize, usize) {
        let dims = x.dims();
        if let Err(err) = self.check_input(dims) {
            panic!("{err}");
        }
        let [batch, channels, time, height, width] = dims;
        let p = self.patch_size;
        let (rows, cols) = self.grid(height, width);

        // [B, C, T, H, W] -> [B*T, C, H, W]
        let frames = x.swap_dims(1, 2).reshape([batch * time, channels, height, width]);

        // Extract non-overlapping patches: [B*T, rows, cols, C, p, p]
        let patches = frames
            .reshape([batch * time, channels, rows, p, cols, p])
            .permute([0, 2, 4, 1, 3, 5]);

        let patch_dim = channels * p * p;
        let num_tokens = batch * time * rows * cols;
        let patches = patches.reshape([num_tokens, patch_dim]);

        // Kernel [embed, C, p, p] -> [patch_dim, embed]
        let weight = self
            .weight
            .val()
            .reshape([self.embed_dim, patch_dim])
            .transpose();

        let tokens = patches.matmul(weight) + self.bias.val().unsqueeze_dim(0);
        let tokens = tokens.reshape([batch * time, rows * cols, self.embed_dim]);

        (tokens, time, cols)
    }
}

/// Source index for every target position under nearest-neighbour resizing.
///
/// Follows the floor(dst * in / out) rule, so upsampling repeats entries and
/// downsampling keeps every `in / out`-th entry starting at 0.
pub fn nearest_indices(in_len: usize, out_len: usize) -> Vec<usize> {
    let scale = in_len as f64 / out_len as f64;
    (0..out_len)
        .map(|i| ((i as f64 * scale).floor() as usize).min(in_len.saturating_sub(1)))
        .collect()
}

/// Row indices into a raster-ordered `src` grid that produce the `dst` grid
pub fn grid_indices(src: (usize, usize), dst: (usize, usize)) -> Vec<usize> {
    let rows = nearest_indices(src.0, dst.0);
    let cols = nearest_indices(src.1, dst.1);
    rows.iter()
        .flat_map(|r| cols.iter().map(move |c| r * src.1 + c))
        .collect()
}

/// Resize a positional embedding [1, 1 + src_rows * src_cols, C] to a new
/// patch grid. The class-token row is kept as is.
pub fn resize_pos_embed<B: Backend>(
    pos_embed: Tensor<B, 3>,
    src: (usize, usize),
    dst: (usize, usize),
) -> Tensor<B, 3> {
    let [_, len, channels] = pos_embed.dims();
    let device = pos_embed.device();

    let cls = pos_embed.clone().slice([0..1, 0..1, 0..channels]);
    let grid = pos_embed.slice([0..1, 1..len, 0..channels]);

    let indices: Vec<i64> = grid_indices(src, dst).into_iter().map(|i| i as i64).collect();
    let grid = grid.select(1, Tensor::<B, 1, Int>::from_ints(indices.as_slice(), &device));

    Tensor::cat(vec![cls, grid], 1)
}

/// Resize a temporal embedding [1, T_src, C] to `frames` entries
pub fn resize_time_embed<B: Backend>(time_embed: Tensor<B, 3>, frames: usize) -> Tensor<B, 3> {
    let [_, len, _] = time_embed.dims();
    let device = time_embed.device();
    let indices: Vec<i64> = nearest_indices(len, frames)
        .into_iter()
        .map(|i| i as i64)
        .collect();
    time_embed.select(1, Tensor::<B, 1, Int>::from_ints(indices.as_slice(), &device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::tensor::{TensorData, Tolerance};

    type TestBackend = NdArray<f32>;

    fn small_config() -> TimeSformerConfig {
        TimeSformerConfig::new()
            .with_img_size(8)
            .with_patch_size(4)
            .with_embed_dim(6)
            .with_num_heads(2)
    }

    #[test]
    fn nearest_indices_match_floor_rule() {
        assert_eq!(nearest_indices(4, 8), vec![0, 0, 1, 1, 2, 2, 3, 3]);
        assert_eq!(nearest_indices(8, 4), vec![0, 2, 4, 6]);
        assert_eq!(nearest_indices(14, 14), (0..14).collect::<Vec<_>>());
        assert_eq!(nearest_indices(3, 2), vec![0, 1]);
        assert_eq!(nearest_indices(1, 3), vec![0, 0, 0]);
    }

    #[test]
    fn grid_indices_are_raster_ordered() {
        assert_eq!(grid_indices((2, 2), (2, 4)), vec![0, 0, 1, 1, 2, 2, 3, 3]);
        assert_eq!(grid_indices((4, 4), (2, 2)), vec![0, 2, 8, 10]);
    }

    #[test]
    fn patch_embed_output_shape() {
        let device = NdArrayDevice::default();
        let embed = PatchEmbed::<TestBackend>::new(&small_config(), &device);
        let x = Tensor::random([2, 3, 5, 8, 12], Distribution::Default, &device);

        let (tokens, frames, cols) = embed.forward(x);
        assert_eq!(tokens.dims(), [10, 6, 6]);
        assert_eq!(frames, 5);
        assert_eq!(cols, 3);
    }

    #[test]
    fn patch_embed_matches_direct_convolution() {
        let device = NdArrayDevice::default();
        let config = TimeSformerConfig::new()
            .with_img_size(4)
            .with_patch_size(2)
            .with_in_chans(1)
            .with_embed_dim(2)
            .with_num_heads(1);
        let mut embed = PatchEmbed::<TestBackend>::new(&config, &device);
        // channel 0 sums the patch, channel 1 picks its top-left pixel
        embed.weight = Param::from_tensor(Tensor::from_data(
            TensorData::new(vec![1.0f32, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0], [2, 1, 2, 2]),
            &device,
        ));
        embed.bias = Param::from_tensor(Tensor::from_floats([0.0, 10.0], &device));

        let pixels: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let x = Tensor::<TestBackend, 5>::from_data(TensorData::new(pixels, [1, 1, 1, 4, 4]), &device);
        let (tokens, _, cols) = embed.forward(x);
        assert_eq!(cols, 2);

        // patches (raster): [0,1,4,5], [2,3,6,7], [8,9,12,13], [10,11,14,15]
        let expected = TensorData::new(
            vec![10.0f32, 10.0, 18.0, 12.0, 42.0, 18.0, 50.0, 20.0],
            [1, 4, 2],
        );
        tokens.to_data().assert_approx_eq(&expected, Tolerance::<f32>::absolute(1e-5));
    }

    #[test]
    fn check_input_reports_shape_errors() {
        let device = NdArrayDevice::default();
        let embed = PatchEmbed::<TestBackend>::new(&small_config(), &device);
        assert_eq!(
            embed.check_input([1, 3, 2, 10, 8]),
            Err(ShapeError::NotDivisible { height: 10, width: 8, patch_size: 4 })
        );
        assert_eq!(
            embed.check_input([1, 1, 2, 8, 8]),
            Err(ShapeError::ChannelMismatch { expected: 3, actual: 1 })
        );
        assert!(matches!(embed.check_input([1, 3, 0, 8, 8]), Err(ShapeError::Empty { .. })));
        assert!(embed.check_input([1, 3, 2, 8, 8]).is_ok());
    }

    #[test]
    #[should_panic(expected = "not divisible")]
    fn forward_panics_on_indivisible_frames() {
        let device = NdArrayDevice::default();
        let embed = PatchEmbed::<TestBackend>::new(&small_config(), &device);
        let x = Tensor::zeros([1, 3, 1, 9, 8], &device);
        let _ = embed.forward(x);
    }

    #[test]
    fn resized_pos_embed_keeps_class_row() {
        let device = NdArrayDevice::default();
        let channels = 3;
        let values: Vec<f32> = (0..(1 + 4) * channels).map(|v| v as f32).collect();
        let pos = Tensor::<TestBackend, 3>::from_data(TensorData::new(values, [1, 5, channels]), &device);

        let resized = resize_pos_embed(pos.clone(), (2, 2), (3, 4));
        assert_eq!(resized.dims(), [1, 13, channels]);

        let cls = resized.clone().slice([0..1, 0..1, 0..channels]);
        assert_eq!(cls.to_data(), pos.slice([0..1, 0..1, 0..channels]).to_data());

        // last target cell maps to the last source cell
        let last = resized.slice([0..1, 12..13, 0..channels]);
        assert_eq!(last.to_data(), TensorData::new(vec![12.0f32, 13.0, 14.0], [1, 1, channels]));
    }

    #[test]
    fn resized_time_embed_repeats_frames() {
        let device = NdArrayDevice::default();
        let time = Tensor::<TestBackend, 3>::from_data(TensorData::new(vec![1.0f32, 2.0], [1, 2, 1]), &device);
        let resized = resize_time_embed(time, 4);
        assert_eq!(resized.to_data(), TensorData::new(vec![1.0f32, 1.0, 2.0, 2.0], [1, 4, 1]));
    }
}
