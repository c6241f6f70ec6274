//! Dimension-generic building blocks.
//!
//! Tensors are laid out as `[batch, channels, s_1, .., s_k]` where `k` is the
//! configured spatial dimensionality (`dims`, 1 to 3). The tensor rank `D` is
//! a const generic of the forward functions and must equal `dims + 2`.

mod conv;
mod conv_transpose;
mod norm;
mod pool;

pub use conv::{ConvNd, ConvNdConfig};
pub use conv_transpose::{ConvTransposeNd, ConvTransposeNdConfig};
pub use norm::{BatchNormNd, BatchNormNdConfig};
pub use pool::max_pool_nd;

use crate::error::{Error, Result};
use burn::prelude::*;

/// Highest spatial dimensionality with a backing convolution in burn.
pub const MAX_DIMS: usize = 3;

pub fn check_dims(dims: usize) -> Result<()> {
    if (1..=MAX_DIMS).contains(&dims) {
        Ok(())
    } else {
        Err(Error::UnsupportedDims(dims))
    }
}

/// Checks that a rank `D` tensor matches `dims` spatial axes.
pub fn check_rank<const D: usize>(dims: usize) -> Result<()> {
    check_dims(dims)?;
    if D != dims + 2 {
        return Err(Error::RankMismatch {
            dims,
            expected: dims + 2,
            got: D,
        });
    }
    Ok(())
}

/// Reinterprets a tensor under another const rank with the same shape.
///
/// Both ranks must describe the same number of axes.
pub(crate) fn rerank<B: Backend, const D1: usize, const D2: usize>(
    x: Tensor<B, D1>,
) -> Tensor<B, D2> {
    debug_assert_eq!(D1, D2);
    let mut shape = [0usize; D2];
    shape.copy_from_slice(&x.dims());
    x.reshape(shape)
}

/// # Shapes
///   - Input [batch, channels, ..spatial]
///   - Output [batch, channels, positions]
pub fn flatten_spatial<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, 3> {
    let dims = x.dims();
    let positions = dims[2..].iter().product::<usize>();
    x.reshape([dims[0], dims[1], positions])
}

/// Expands per-channel values so they broadcast over every spatial axis.
///
/// # Shapes
///   - Input [batch, channels]
///   - Output [batch, channels, 1, .., 1]
pub fn expand_spatial<B: Backend, const D: usize>(x: Tensor<B, 2>) -> Tensor<B, D> {
    let [batch, channels] = x.dims();
    let mut shape = [1usize; D];
    shape[0] = batch;
    shape[1] = channels;
    x.reshape(shape)
}

/// Spatial part of a `[batch, channels, ..spatial]` shape.
pub fn spatial_shape<const D: usize>(shape: [usize; D]) -> Vec<usize> {
    shape[2..].to_vec()
}
