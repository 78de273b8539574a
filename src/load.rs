//! Weight loading utilities for TimeSformer models.

use std::path::PathBuf;

use burn::module::Param;
use burn::nn::Linear;
use burn::prelude::*;
use burn::store::{BurnpackStore, ModuleStore};
use thiserror::Error;
use tracing::{info, warn};

use crate::modules::init::{join, LayerKind, LayerVisitor, VisitLayers};
use crate::modules::vit::VisionTransformer;
use crate::weights::{Checkpoint, CheckpointTensor};

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid safetensors file: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
    #[error("tensor `{name}` has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },
    #[error("Error while loading weights: {0}")]
    LoadError(String),
    #[error("Unrecognised file extension")]
    UnknownExtension,
}

/// Outcome of applying a checkpoint to a model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters copied from the checkpoint
    pub applied: Vec<String>,
    /// Model parameters with no checkpoint entry
    pub missing: Vec<String>,
    /// Checkpoint entries whose shape does not fit the model
    pub mismatched: Vec<String>,
    /// Checkpoint entries no model parameter asked for
    pub unexpected: Vec<String>,
}

impl LoadReport {
    /// Every model parameter was loaded and nothing was left over
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.unexpected.is_empty()
    }
}

/// Copies checkpoint tensors into the layers it visits
struct CheckpointLoader<'a> {
    checkpoint: &'a Checkpoint,
    report: LoadReport,
}

impl<'a> CheckpointLoader<'a> {
    /// Look up `name`, checking it against the model's shape
    fn take(&mut self, name: String, expected: &[usize]) -> Option<&'a CheckpointTensor> {
        match self.checkpoint.get(&name) {
            None => {
                warn!(tensor = %name, "missing from checkpoint");
                self.report.missing.push(name);
                None
            }
            Some(tensor) if tensor.shape != expected => {
                warn!(tensor = %name, checkpoint = ?tensor.shape, model = ?expected, "shape mismatch, keeping initialized value");
                self.report.mismatched.push(name);
                None
            }
            Some(tensor) => {
                self.report.applied.push(name);
                Some(tensor)
            }
        }
    }

    fn load<B: Backend, const D: usize>(&mut self, name: String, param: &mut Param<Tensor<B, D>>) {
        let current = param.val();
        let device = current.device();
        if let Some(tensor) = self.take(name, &current.dims()) {
            *param = Param::from_tensor(tensor.to_tensor(&device));
        }
    }

    fn load_linear<B: Backend>(&mut self, path: &str, linear: &mut Linear<B>) {
        // Checkpoints store [out, in]; burn stores [in, out]
        let weight = linear.weight.val();
        let device = weight.device();
        let [d_in, d_out] = weight.dims();
        if let Some(tensor) = self.take(join(path, "weight"), &[d_out, d_in]) {
            let weight = tensor.to_tensor::<B, 2>(&device).transpose();
            linear.weight = Param::from_tensor(weight);
        }
        if let Some(bias) = linear.bias.as_mut() {
            self.load(join(path, "bias"), bias);
        }
    }
}

impl<B: Backend> LayerVisitor<B> for CheckpointLoader<'_> {
    fn visit(&mut self, path: &str, layer: LayerKind<'_, B>) {
        match layer {
            LayerKind::Linear(linear) => self.load_linear(path, linear),
            LayerKind::Norm(norm) => {
                self.load(join(path, "weight"), &mut norm.weight);
                self.load(join(path, "bias"), &mut norm.bias);
            }
            LayerKind::PatchProjection(embed) => {
                self.load(join(path, "weight"), &mut embed.weight);
                self.load(join(path, "bias"), &mut embed.bias);
            }
            LayerKind::Embedding(param) => self.load(path.to_string(), param),
        }
    }
}

impl<B: Backend> VisionTransformer<B> {
    /// Apply an adapted checkpoint, skipping absent and mis-shaped entries
    pub fn load_checkpoint(&mut self, checkpoint: &Checkpoint) -> LoadReport {
        let mut loader = CheckpointLoader {
            checkpoint,
            report: LoadReport::default(),
        };
        self.visit_layers("", &mut loader);

        let mut report = loader.report;
        report.unexpected = checkpoint
            .names()
            .filter(|name| {
                !report.applied.iter().any(|n| n == name) && !report.mismatched.iter().any(|n| n == name)
            })
            .map(str::to_string)
            .collect();
        for name in &report.unexpected {
            warn!(tensor = %name, "unused checkpoint entry");
        }

        info!(
            applied = report.applied.len(),
            missing = report.missing.len(),
            mismatched = report.mismatched.len(),
            unexpected = report.unexpected.len(),
            "applied checkpoint"
        );
        report
    }

    /// Load weights and return self (builder pattern)
    ///
    /// Use [`Self::load_weights`] to inspect the [`LoadReport`].
    pub fn with_weights(mut self, path: impl Into<PathBuf>) -> Result<Self, ModelLoadError> {
        self.load_weights(path)?;
        Ok(self)
    }

    /// Load weights from a file
    ///
    /// Supports:
    /// - `.safetensors` - PyTorch checkpoint (ViT or TimeSformer naming), converted for this model
    /// - `.bpk` - Burn native format
    ///
    /// The report lists what a safetensors checkpoint did not cover. It is
    /// empty for `.bpk` files, which must match the model exactly.
    pub fn load_weights(&mut self, path: impl Into<PathBuf>) -> Result<LoadReport, ModelLoadError> {
        let path = path.into();
        let extension = path.extension().map(|s| s.to_string_lossy().to_lowercase());

        match extension.as_deref() {
            Some("safetensors") => {
                info!(path = %path.display(), "loading weights from safetensors");
                let mut checkpoint = Checkpoint::from_safetensors(&path)?;
                checkpoint.adapt(self.config());
                Ok(self.load_checkpoint(&checkpoint))
            }
            Some("bpk") | None => {
                info!(path = %path.display(), "loading weights from bpk");
                let mut weights = BurnpackStore::from_file(path).auto_extension(false);
                weights
                    .apply_to(self)
                    .map_err(|e| ModelLoadError::LoadError(e.to_string()))?;
                Ok(LoadReport::default())
            }
            _ => Err(ModelLoadError::UnknownExtension),
        }
    }

    /// Save weights in Burn native format
    pub fn save_bpk(&self, path: impl Into<PathBuf>) -> Result<(), ModelLoadError> {
        let path = path.into();
        let mut store = BurnpackStore::from_file(path.clone()).auto_extension(false);
        store
            .collect_from(self)
            .map_err(|e| ModelLoadError::LoadError(e.to_string()))?;
        info!(path = %path.display(), "saved weights");
        Ok(())
    }
}
