//! Checkpoint state dicts and pretrained-weight conversion.
//!
//! A [`Checkpoint`] is a flat `name -> f32 array` map read from safetensors.
//! [`Checkpoint::adapt`] rewrites an ImageNet ViT or TimeSformer checkpoint so
//! its names and shapes line up with a target [`TimeSformerConfig`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::TensorData;
use half::{bf16, f16};
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info, warn};

use crate::load::ModelLoadError;
use crate::modules::embeddings::{grid_indices, nearest_indices};
use crate::{AttentionType, TimeSformerConfig};

/// One tensor of a checkpoint, decoded to f32.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTensor {
    /// Shape as a list of dimensions.
    pub shape: Vec<usize>,
    /// Values in row-major order.
    pub values: Vec<f32>,
}

impl CheckpointTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        Self { shape, values }
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.values.len()
    }

    /// Build a tensor of rank `D` on `device`.
    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Tensor<B, D> {
        Tensor::from_data(TensorData::new(self.values.clone(), self.shape.clone()), device)
    }

    fn from_view(name: &str, view: &safetensors::tensor::TensorView<'_>) -> Result<Self, ModelLoadError> {
        let bytes = view.data();
        let values: Vec<f32> = match view.dtype() {
            Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            Dtype::F16 => bytes
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            Dtype::BF16 => bytes
                .chunks_exact(2)
                .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            Dtype::F64 => bytes
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
                .collect(),
            other => {
                return Err(ModelLoadError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: format!("{other:?}"),
                })
            }
        };
        Ok(Self::new(view.shape().to_vec(), values))
    }
}

/// Flat state dict keyed by checkpoint parameter name.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    tensors: BTreeMap<String, CheckpointTensor>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a `.safetensors` file.
    pub fn from_safetensors(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let checkpoint = Self::from_bytes(&bytes)?;
        info!(path = %path.display(), tensors = checkpoint.len(), "read checkpoint");
        Ok(checkpoint)
    }

    /// Decode an in-memory safetensors buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelLoadError> {
        let tensors = SafeTensors::deserialize(bytes)?;
        let mut checkpoint = Self::new();
        for (name, view) in tensors.tensors() {
            // Training wrappers prefix parameters with `model.` or `module.`
            let key = name
                .strip_prefix("module.")
                .or_else(|| name.strip_prefix("model."))
                .unwrap_or(&name)
                .to_string();
            checkpoint.insert(key, CheckpointTensor::from_view(&name, &view)?);
        }
        Ok(checkpoint)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: CheckpointTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&CheckpointTensor> {
        self.tensors.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<CheckpointTensor> {
        self.tensors.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Parameter names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Convert a pretrained checkpoint for `config`.
    ///
    /// Steps, in order:
    /// 1. reshape a flattened patch kernel to `[out, 3, p, p]`
    /// 2. adapt the patch kernel to `config.in_chans`
    /// 3. drop a classifier whose class count differs
    /// 4. resize `pos_embed` to the target patch grid
    /// 5. resize `time_embed` to the target clip length (drop it for space-only)
    /// 6. for divided space-time, seed `temporal_attn` / `temporal_norm1`
    ///    from the spatial `attn` / `norm1` where they are missing
    ///
    /// Entries that cannot be converted are left untouched; the loader then
    /// reports them as mismatched.
    pub fn adapt(&mut self, config: &TimeSformerConfig) {
        self.unflatten_patch_kernel(config.patch_size);
        self.adapt_in_chans(config.in_chans);
        self.drop_mismatched_head(config.num_classes);
        self.resize_pos_embed(config.grid_size());
        match config.attention_type {
            AttentionType::SpaceOnly => {
                if self.remove("time_embed").is_some() {
                    debug!("dropped time_embed for space_only attention");
                }
            }
            _ => self.resize_time_embed(config.num_frames),
        }
        if config.attention_type == AttentionType::DividedSpaceTime {
            self.seed_temporal_branches();
        }
    }

    fn unflatten_patch_kernel(&mut self, patch_size: usize) {
        let Some(kernel) = self.tensors.get_mut(PATCH_WEIGHT) else {
            return;
        };
        let &[out, flat] = kernel.shape.as_slice() else {
            return;
        };

        let side = if flat == 3 * patch_size * patch_size {
            Some(patch_size)
        } else {
            // Checkpoint trained with another patch size
            let side = ((flat / 3) as f64).sqrt().round() as usize;
            (flat % 3 == 0 && side * side * 3 == flat).then_some(side)
        };

        match side {
            Some(side) => {
                kernel.shape = vec![out, 3, side, side];
                debug!(patch_size = side, "reshaped flattened patch kernel");
            }
            None => warn!(shape = ?kernel.shape, "cannot unflatten patch kernel"),
        }
    }

    fn adapt_in_chans(&mut self, in_chans: usize) {
        let Some(kernel) = self.tensors.get_mut(PATCH_WEIGHT) else {
            return;
        };
        let &[out, src_chans, kh, kw] = kernel.shape.as_slice() else {
            return;
        };
        if src_chans == in_chans {
            return;
        }
        if src_chans == 0 || in_chans == 0 {
            warn!(shape = ?kernel.shape, to = in_chans, "cannot adapt patch kernel channels");
            return;
        }

        let plane = kh * kw;
        let mut values = Vec::with_capacity(out * in_chans * plane);
        if in_chans == 1 {
            // Grayscale: sum the colour kernels
            for o in 0..out {
                let filter = &kernel.values[o * src_chans * plane..(o + 1) * src_chans * plane];
                values.extend((0..plane).map(|i| (0..src_chans).map(|c| filter[c * plane + i]).sum::<f32>()));
            }
        } else {
            // Tile the colour kernels and keep the activation scale
            let scale = src_chans as f32 / in_chans as f32;
            for o in 0..out {
                let filter = &kernel.values[o * src_chans * plane..(o + 1) * src_chans * plane];
                for c in 0..in_chans {
                    let src = &filter[(c % src_chans) * plane..(c % src_chans + 1) * plane];
                    values.extend(src.iter().map(|v| v * scale));
                }
            }
        }

        info!(from = src_chans, to = in_chans, "adapted patch kernel input channels");
        *kernel = CheckpointTensor::new(vec![out, in_chans, kh, kw], values);
    }

    fn drop_mismatched_head(&mut self, num_classes: usize) {
        let Some(classes) = self.get("head.weight").map(|head| head.shape[0]) else {
            return;
        };
        if num_classes > 0 && classes == num_classes {
            return;
        }
        self.remove("head.weight");
        self.remove("head.bias");
        info!(checkpoint = classes, target = num_classes, "dropped classifier head");
    }

    fn resize_pos_embed(&mut self, grid: usize) {
        let Some(pos) = self.tensors.get_mut("pos_embed") else {
            return;
        };
        let &[1, len, channels] = pos.shape.as_slice() else {
            warn!(shape = ?pos.shape, "unexpected pos_embed shape");
            return;
        };
        let target = grid * grid + 1;
        if len == target {
            return;
        }
        if len < 2 {
            warn!(tokens = len, "pos_embed has no patch grid; leaving as is");
            return;
        }

        let src = ((len - 1) as f64).sqrt().round() as usize;
        if src * src != len - 1 {
            warn!(tokens = len - 1, "pos_embed grid is not square; leaving as is");
            return;
        }

        let mut values = Vec::with_capacity(target * channels);
        values.extend_from_slice(&pos.values[..channels]);
        for row in grid_indices((src, src), (grid, grid)) {
            let start = (row + 1) * channels;
            values.extend_from_slice(&pos.values[start..start + channels]);
        }

        info!(from = src, to = grid, "resized pos_embed grid");
        *pos = CheckpointTensor::new(vec![1, target, channels], values);
    }

    fn resize_time_embed(&mut self, frames: usize) {
        let Some(time) = self.tensors.get_mut("time_embed") else {
            return;
        };
        let &[1, len, channels] = time.shape.as_slice() else {
            warn!(shape = ?time.shape, "unexpected time_embed shape");
            return;
        };
        if len == frames || len == 0 {
            return;
        }

        let mut values = Vec::with_capacity(frames * channels);
        for t in nearest_indices(len, frames) {
            values.extend_from_slice(&time.values[t * channels..(t + 1) * channels]);
        }

        info!(from = len, to = frames, "resized time_embed");
        *time = CheckpointTensor::new(vec![1, frames, channels], values);
    }

    fn seed_temporal_branches(&mut self) {
        let seeded: Vec<(String, CheckpointTensor)> = self
            .tensors
            .iter()
            .filter_map(|(name, tensor)| {
                let temporal = temporal_name(name)?;
                (!self.tensors.contains_key(&temporal)).then(|| (temporal, tensor.clone()))
            })
            .collect();

        if !seeded.is_empty() {
            info!(tensors = seeded.len(), "initialized temporal attention from spatial attention");
        }
        self.tensors.extend(seeded);
    }
}

const PATCH_WEIGHT: &str = "patch_embed.proj.weight";

/// `blocks.N.attn.*` -> `blocks.N.temporal_attn.*`,
/// `blocks.N.norm1.*` -> `blocks.N.temporal_norm1.*`
fn temporal_name(name: &str) -> Option<String> {
    let rest = name.strip_prefix("blocks.")?;
    let (index, param) = rest.split_once('.')?;
    index.parse::<usize>().ok()?;
    let param = param
        .strip_prefix("attn.")
        .map(|p| format!("temporal_attn.{p}"))
        .or_else(|| param.strip_prefix("norm1.").map(|p| format!("temporal_norm1.{p}")))?;
    Some(format!("blocks.{index}.{param}"))
}
