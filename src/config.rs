//! TimeSformer model configuration

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::config::Config;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a block mixes tokens across space and time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    /// Temporal attention per spatial location, then spatial attention per frame
    DividedSpaceTime,
    /// Each frame is classified on its own; predictions are averaged over frames
    SpaceOnly,
    /// One attention over every patch of every frame
    JointSpaceTime,
}

impl AttentionType {
    /// All recognised attention types
    pub const ALL: [AttentionType; 3] = [
        AttentionType::DividedSpaceTime,
        AttentionType::SpaceOnly,
        AttentionType::JointSpaceTime,
    ];

    /// Canonical name, as used in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionType::DividedSpaceTime => "divided_space_time",
            AttentionType::SpaceOnly => "space_only",
            AttentionType::JointSpaceTime => "joint_space_time",
        }
    }

    /// Whether the model carries a temporal embedding
    pub fn uses_time_embed(&self) -> bool {
        !matches!(self, AttentionType::SpaceOnly)
    }
}

impl fmt::Display for AttentionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttentionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttentionType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownAttentionType(s.to_string()))
    }
}

/// Errors raised while validating or loading a configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown attention type `{0}` (expected divided_space_time, space_only or joint_space_time)")]
    UnknownAttentionType(String),
    #[error("image size {img_size} is not divisible by patch size {patch_size}")]
    PatchSizeMismatch { img_size: usize, patch_size: usize },
    #[error("embedding width {embed_dim} is not divisible by {num_heads} heads")]
    HeadsDoNotDivide { embed_dim: usize, num_heads: usize },
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("`{name}` must lie in [0, 1), got {value}")]
    InvalidRate { name: &'static str, value: f64 },
    #[error("failed to read config: {0}")]
    Load(String),
}

/// Configuration for the TimeSformer video classifier.
///
/// Defaults describe the ViT-Base/16 backbone used for Kinetics-400 with
/// 8-frame clips at 224x224.
#[derive(Config, Debug)]
pub struct TimeSformerConfig {
    /// Input frame height and width in pixels (default: 224)
    #[config(default = 224)]
    pub img_size: usize,

    /// Square patch side in pixels (default: 16)
    #[config(default = 16)]
    pub patch_size: usize,

    /// Input channels (default: 3)
    #[config(default = 3)]
    pub in_chans: usize,

    /// Number of output classes; 0 disables the classifier head (default: 400)
    #[config(default = 400)]
    pub num_classes: usize,

    /// Token embedding width (default: 768)
    #[config(default = 768)]
    pub embed_dim: usize,

    /// Number of transformer blocks (default: 12)
    #[config(default = 12)]
    pub depth: usize,

    /// Attention heads per block (default: 12)
    #[config(default = 12)]
    pub num_heads: usize,

    /// Mlp hidden width as a multiple of the embedding width (default: 4.0)
    #[config(default = 4.0)]
    pub mlp_ratio: f64,

    /// Bias on the query/key/value projection (default: true)
    #[config(default = true)]
    pub qkv_bias: bool,

    /// Override for the attention scale (default: head_dim^-0.5)
    pub qk_scale: Option<f64>,

    /// Dropout on embeddings, projections and the mlp (default: 0.0)
    #[config(default = 0.0)]
    pub drop_rate: f64,

    /// Dropout on attention weights (default: 0.0)
    #[config(default = 0.0)]
    pub attn_drop_rate: f64,

    /// Drop-path rate of the last block; earlier blocks scale linearly from 0 (default: 0.1)
    #[config(default = 0.1)]
    pub drop_path_rate: f64,

    /// Frames per clip the temporal embedding is sized for (default: 8)
    #[config(default = 8)]
    pub num_frames: usize,

    /// Space-time attention scheme (default: divided_space_time)
    #[config(default = "AttentionType::DividedSpaceTime")]
    pub attention_type: AttentionType,

    /// Layer norm epsilon (default: 1e-6)
    #[config(default = 1e-6)]
    pub norm_eps: f64,
}

impl Default for TimeSformerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSformerConfig {
    /// ViT-Base/16 backbone with the given input size, class count and clip length
    pub fn vit_base_patch16(img_size: usize, num_classes: usize, num_frames: usize) -> Self {
        Self::new()
            .with_img_size(img_size)
            .with_num_classes(num_classes)
            .with_num_frames(num_frames)
    }

    /// Read a JSON config file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = Self::load(path).map_err(|e| {
            let message = e.to_string();
            // serde reports the offending variant; surface it as a typed error
            match unknown_variant(&message) {
                Some(name) => ConfigError::UnknownAttentionType(name),
                None => ConfigError::Load(format!("{}: {message}", path.display())),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every module relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("img_size", self.img_size),
            ("patch_size", self.patch_size),
            ("in_chans", self.in_chans),
            ("embed_dim", self.embed_dim),
            ("depth", self.depth),
            ("num_heads", self.num_heads),
            ("num_frames", self.num_frames),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.img_size % self.patch_size != 0 {
            return Err(ConfigError::PatchSizeMismatch {
                img_size: self.img_size,
                patch_size: self.patch_size,
            });
        }

        if self.embed_dim % self.num_heads != 0 {
            return Err(ConfigError::HeadsDoNotDivide {
                embed_dim: self.embed_dim,
                num_heads: self.num_heads,
            });
        }

        if self.mlp_hidden_dim() == 0 {
            return Err(ConfigError::Zero("mlp_ratio"));
        }

        for (name, value) in [
            ("drop_rate", self.drop_rate),
            ("attn_drop_rate", self.attn_drop_rate),
            ("drop_path_rate", self.drop_path_rate),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(ConfigError::InvalidRate { name, value });
            }
        }

        Ok(())
    }

    /// Patch grid side length
    pub fn grid_size(&self) -> usize {
        self.img_size / self.patch_size
    }

    /// Spatial patches per frame
    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Attention head width
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Mlp hidden width
    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// Stochastic depth decay rule: linearly spaced from 0 to `drop_path_rate`
    pub fn drop_path_rates(&self) -> Vec<f64> {
        if self.depth <= 1 {
            return vec![0.0; self.depth];
        }
        let step = self.drop_path_rate / (self.depth - 1) as f64;
        (0..self.depth).map(|i| step * i as f64).collect()
    }

    /// Number of learnable parameters
    pub fn num_params(&self) -> usize {
        let c = self.embed_dim;
        let hidden = self.mlp_hidden_dim();
        let qkv_bias = if self.qkv_bias { 3 * c } else { 0 };

        let attention = c * 3 * c + qkv_bias + c * c + c;
        let norm = 2 * c;
        let mlp = c * hidden + hidden + hidden * c + c;
        let temporal = match self.attention_type {
            AttentionType::DividedSpaceTime => norm + attention + c * c + c,
            _ => 0,
        };
        let block = norm + attention + temporal + norm + mlp;

        let patch = c * self.in_chans * self.patch_size * self.patch_size + c;
        let time = if self.attention_type.uses_time_embed() {
            self.num_frames * c
        } else {
            0
        };
        let embeddings = c + (self.num_patches() + 1) * c + time;
        let head = if self.num_classes > 0 {
            c * self.num_classes + self.num_classes
        } else {
            0
        };

        patch + embeddings + self.depth * block + norm + head
    }
}

fn unknown_variant(message: &str) -> Option<String> {
    let rest = message.split("unknown variant `").nth(1)?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}
