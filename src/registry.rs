//! Named model constructors.
//!
//! Builders are registered explicitly on a [`ModelRegistry`] value; nothing is
//! registered as a side effect of linking the crate.

use std::collections::BTreeMap;
use std::path::PathBuf;

use burn::module::Module;
use burn::prelude::*;
use thiserror::Error;
use tracing::{info, warn};

use crate::load::{LoadReport, ModelLoadError};
use crate::modules::vit::VisionTransformer;
use crate::{AttentionType, ConfigError, TimeSformerConfig};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no model registered as `{name}` (available: {available})")]
    UnknownModel { name: String, available: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] ModelLoadError),
}

/// Options shared by every registered builder
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOptions {
    /// Frame height and width in pixels
    pub img_size: usize,
    /// Output classes
    pub num_classes: usize,
    /// Frames per clip
    pub num_frames: usize,
    /// Space-time attention scheme
    pub attention_type: AttentionType,
    /// Checkpoint to load after construction (`.safetensors` or `.bpk`)
    pub pretrained: Option<PathBuf>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            img_size: 224,
            num_classes: 400,
            num_frames: 8,
            attention_type: AttentionType::DividedSpaceTime,
            pretrained: None,
        }
    }
}

/// Turns options into a model configuration
pub type ConfigBuilder = fn(&ModelOptions) -> TimeSformerConfig;

/// Name -> builder table
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    builders: BTreeMap<String, ConfigBuilder>,
}

impl ModelRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `vit_base_patch16_224` and `TimeSformer`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("vit_base_patch16_224", vit_base_patch16_224);
        registry.register("TimeSformer", vit_base_patch16_224);
        registry
    }

    /// Add or replace a builder
    pub fn register(&mut self, name: impl Into<String>, builder: ConfigBuilder) {
        self.builders.insert(name.into(), builder);
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    /// Configuration a builder produces for `options`
    pub fn config(&self, name: &str, options: &ModelOptions) -> Result<TimeSformerConfig, RegistryError> {
        let builder = self.builders.get(name).ok_or_else(|| RegistryError::UnknownModel {
            name: name.to_string(),
            available: self.names().collect::<Vec<_>>().join(", "),
        })?;
        let config = builder(options);
        config.validate()?;
        Ok(config)
    }

    /// Build a model, loading `options.pretrained` when set
    ///
    /// Tensors a checkpoint leaves uncovered are logged as a warning; use
    /// [`Self::build_with_report`] to act on them.
    pub fn build<B: Backend>(
        &self,
        name: &str,
        options: &ModelOptions,
        device: &B::Device,
    ) -> Result<VisionTransformer<B>, RegistryError> {
        let (model, report) = self.build_with_report(name, options, device)?;
        if let Some(report) = report.filter(|report| !report.is_complete()) {
            warn!(
                model = name,
                applied = report.applied.len(),
                missing = report.missing.len(),
                mismatched = report.mismatched.len(),
                unexpected = report.unexpected.len(),
                "checkpoint did not cover the model"
            );
        }
        Ok(model)
    }

    /// [`Self::build`], also returning the load report when a checkpoint was given
    pub fn build_with_report<B: Backend>(
        &self,
        name: &str,
        options: &ModelOptions,
        device: &B::Device,
    ) -> Result<(VisionTransformer<B>, Option<LoadReport>), RegistryError> {
        let config = self.config(name, options)?;
        let mut model = config.init(device)?;
        let report = match &options.pretrained {
            Some(path) => Some(model.load_weights(path)?),
            None => None,
        };
        info!(model = name, params = model.num_params(), "built model");
        Ok((model, report))
    }
}

/// ViT-Base/16 backbone with drop-path 0.1
fn vit_base_patch16_224(options: &ModelOptions) -> TimeSformerConfig {
    TimeSformerConfig::vit_base_patch16(options.img_size, options.num_classes, options.num_frames)
        .with_drop_path_rate(0.1)
        .with_attention_type(options.attention_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::tests::{f32_bytes, safetensors_bytes};
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    fn tiny(options: &ModelOptions) -> TimeSformerConfig {
        TimeSformerConfig::new()
            .with_img_size(options.img_size)
            .with_patch_size(4)
            .with_embed_dim(8)
            .with_depth(1)
            .with_num_heads(2)
            .with_num_classes(options.num_classes)
            .with_num_frames(options.num_frames)
            .with_attention_type(options.attention_type)
    }

    #[test]
    fn defaults_are_registered() {
        let registry = ModelRegistry::with_defaults();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["TimeSformer", "vit_base_patch16_224"]);

        let options = ModelOptions {
            num_frames: 16,
            attention_type: AttentionType::JointSpaceTime,
            ..ModelOptions::default()
        };
        let config = registry.config("TimeSformer", &options).unwrap();
        assert_eq!(config.embed_dim, 768);
        assert_eq!(config.patch_size, 16);
        assert_eq!(config.num_frames, 16);
        assert_eq!(config.attention_type, AttentionType::JointSpaceTime);
    }

    #[test]
    fn unknown_name_lists_available_models() {
        let registry = ModelRegistry::with_defaults();
        let err = registry.config("vit_large", &ModelOptions::default()).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownModel { .. }));
        assert!(err.to_string().contains("vit_base_patch16_224"));
    }

    #[test]
    fn invalid_options_are_config_errors() {
        let registry = ModelRegistry::with_defaults();
        let options = ModelOptions {
            img_size: 100,
            ..ModelOptions::default()
        };
        let err = registry.config("TimeSformer", &options).unwrap_err();
        assert!(matches!(err, RegistryError::Config(ConfigError::PatchSizeMismatch { .. })));
    }

    #[test]
    fn builds_custom_models() {
        let device = NdArrayDevice::default();
        let mut registry = ModelRegistry::new();
        registry.register("tiny", tiny);

        let options = ModelOptions {
            img_size: 8,
            num_classes: 5,
            num_frames: 2,
            ..ModelOptions::default()
        };
        let model = registry.build::<NdArray<f32>>("tiny", &options, &device).unwrap();
        assert_eq!(model.config().num_classes, 5);

        let missing = ModelOptions {
            pretrained: Some(PathBuf::from("missing.safetensors")),
            ..options
        };
        let err = registry.build::<NdArray<f32>>("tiny", &missing, &device).unwrap_err();
        assert!(matches!(err, RegistryError::Load(ModelLoadError::Io(_))));
    }

    #[test]
    fn build_reports_uncovered_tensors() {
        let device = NdArrayDevice::default();
        let mut registry = ModelRegistry::new();
        registry.register("tiny", tiny);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");
        std::fs::write(
            &path,
            safetensors_bytes(&[
                ("norm.weight", "F32", vec![8], f32_bytes(&[1.0; 8])),
                ("decoder.weight", "F32", vec![2], f32_bytes(&[1.0; 2])),
            ]),
        )
        .unwrap();

        let options = ModelOptions {
            img_size: 8,
            num_classes: 5,
            num_frames: 2,
            pretrained: Some(path),
            ..ModelOptions::default()
        };
        let (model, report) = registry.build_with_report::<NdArray<f32>>("tiny", &options, &device).unwrap();
        let report = report.unwrap();
        assert_eq!(report.applied, vec!["norm.weight".to_string()]);
        assert_eq!(report.unexpected, vec!["decoder.weight".to_string()]);
        assert!(!report.missing.is_empty());
        assert_eq!(model.config().num_classes, 5);

        let scratch = ModelOptions {
            pretrained: None,
            ..options
        };
        let (_, report) = registry.build_with_report::<NdArray<f32>>("tiny", &scratch, &device).unwrap();
        assert!(report.is_none());
    }
}
