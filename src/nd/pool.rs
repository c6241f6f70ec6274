use super::rerank;
use burn::nn::pool::{MaxPool1dConfig, MaxPool2dConfig};
use burn::prelude::*;

/// Max pooling with window 2 and stride 2 along every spatial axis.
///
/// Odd trailing positions are dropped. 1D and 2D inputs go through burn's
/// pooling modules; 3D inputs, where burn has no pooling op, are reduced one
/// spatial axis at a time.
///
/// # Shapes
///   - Input [batch, channels, ..spatial]
///   - Output [batch, channels, ..spatial / 2]
pub fn max_pool_nd<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    match D {
        3 => {
            let pool = MaxPool1dConfig::new(2).with_stride(2).init();
            rerank(pool.forward(rerank::<B, D, 3>(x)))
        }
        4 => {
            let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
            rerank(pool.forward(rerank::<B, D, 4>(x)))
        }
        _ => (2..D).fold(x, pool_axis),
    }
}

/// Halves `axis` by taking the max of consecutive pairs.
///
/// The axis is moved last and the tensor is viewed as `[rest, size / 2, 2]`,
/// so the reduction always runs over the last axis of a rank 3 tensor.
fn pool_axis<B: Backend, const D: usize>(x: Tensor<B, D>, axis: usize) -> Tensor<B, D> {
    let last = D - 1;
    let size = x.dims()[axis];
    let x = if size % 2 != 0 {
        x.narrow(axis, 0, size - 1)
    } else {
        x
    };

    let x = x.swap_dims(axis, last);
    let mut shape = x.dims();
    let half = shape[last] / 2;
    let rest = shape[..last].iter().product::<usize>();
    shape[last] = half;

    x.reshape([rest, half, 2])
        .max_dim(2)
        .reshape(shape)
        .swap_dims(axis, last)
}
