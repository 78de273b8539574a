//! TimeSformer model modules

pub mod attention;
pub mod block;
pub mod drop_path;
pub mod embeddings;
pub mod feed_forward;
pub mod init;
pub mod layout;
pub mod normalization;
pub mod vit;
