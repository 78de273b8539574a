//! TimeSformer video classification in Burn
//!
//! TimeSformer is a convolution-free video classifier built on a ViT
//! backbone. Each block factorizes self-attention over a clip into temporal
//! attention (every patch position attends over its frames) and spatial
//! attention (every frame attends over its patches).
//!
//! ## Architecture
//!
//! - **PatchEmbed**: per-frame 16x16 patch projection
//! - **Embeddings**: class token, positional embedding over the patch grid and
//!   a temporal embedding over frames, both resized on the fly for other inputs
//! - **Blocks**: divided space-time, space-only or joint space-time attention
//! - **Head**: linear classifier over the final class token
//!
//! ## Usage
//!
//! ```rust,ignore
//! use timesformer_burn::{ModelOptions, ModelRegistry};
//!
//! let registry = ModelRegistry::with_defaults();
//! let options = ModelOptions {
//!     pretrained: Some("TimeSformer_divST_8x32_224_K400.safetensors".into()),
//!     ..ModelOptions::default()
//! };
//! let model = registry.build::<Backend>("TimeSformer", &options, &device)?;
//!
//! // [batch, channels, frames, height, width] -> [batch, 400]
//! let logits = model.forward(video);
//! ```

pub mod config;
pub mod load;
pub mod modules;
pub mod registry;
pub mod weights;

// Re-export main types
pub use config::{AttentionType, ConfigError, TimeSformerConfig};
pub use load::{LoadReport, ModelLoadError};
pub use modules::block::Block;
pub use modules::embeddings::ShapeError;
pub use modules::vit::VisionTransformer;
pub use registry::{ModelOptions, ModelRegistry, RegistryError};
pub use weights::{Checkpoint, CheckpointTensor};
