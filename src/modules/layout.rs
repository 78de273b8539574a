//! Token layout conversions for divided space-time attention
//!
//! Patch tokens of one clip are stored as a single `(h w t)` sequence: the
//! spatial position is the major index and the frame index the minor one, so
//! token `n * T + t` is spatial patch `n` of frame `t`. Every function here is
//! a pure permutation.

use burn::prelude::*;

/// `(B, N·T, C)` -> `(B·N, T, C)`: one sequence of T frame tokens per spatial location
pub fn to_temporal<B: Backend>(x: Tensor<B, 3>, batch: usize, frames: usize) -> Tensor<B, 3> {
    let [_, tokens, channels] = x.dims();
    let spatial = tokens / frames;
    x.reshape([batch * spatial, frames, channels])
}

/// `(B·N, T, C)` -> `(B, N·T, C)`
pub fn from_temporal<B: Backend>(x: Tensor<B, 3>, batch: usize) -> Tensor<B, 3> {
    let [rows, frames, channels] = x.dims();
    let spatial = rows / batch;
    x.reshape([batch, spatial * frames, channels])
}

/// `(B, N·T, C)` -> `(B·T, N, C)`: one sequence of N spatial tokens per frame
pub fn to_spatial<B: Backend>(x: Tensor<B, 3>, batch: usize, frames: usize) -> Tensor<B, 3> {
    let [_, tokens, channels] = x.dims();
    let spatial = tokens / frames;
    x.reshape([batch, spatial, frames, channels])
        .swap_dims(1, 2)
        .reshape([batch * frames, spatial, channels])
}

/// `(B·T, N, C)` -> `(B, N·T, C)`
pub fn from_spatial<B: Backend>(x: Tensor<B, 3>, batch: usize) -> Tensor<B, 3> {
    let [rows, spatial, channels] = x.dims();
    let frames = rows / batch;
    x.reshape([batch, frames, spatial, channels])
        .swap_dims(1, 2)
        .reshape([batch, spatial * frames, channels])
}

/// Frame rows `(B·T, N, C)` -> temporal rows `(B·N, T, C)`
pub fn frames_to_temporal<B: Backend>(x: Tensor<B, 3>, batch: usize) -> Tensor<B, 3> {
    let [rows, spatial, channels] = x.dims();
    let frames = rows / batch;
    x.reshape([batch, frames, spatial, channels])
        .swap_dims(1, 2)
        .reshape([batch * spatial, frames, channels])
}

/// `(B·T, L, C)` -> `(B, L, C)` averaged over frames
pub fn mean_over_frames<B: Backend>(x: Tensor<B, 3>, batch: usize) -> Tensor<B, 3> {
    let [rows, len, channels] = x.dims();
    let frames = rows / batch;
    x.reshape([batch, frames, len, channels])
        .mean_dim(1)
        .reshape([batch, len, channels])
}
