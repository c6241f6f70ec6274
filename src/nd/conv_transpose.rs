use super::{check_dims, rerank};
use crate::error::{Error, Result};
use burn::nn::conv::{
    ConvTranspose1d, ConvTranspose1dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    ConvTranspose3d, ConvTranspose3dConfig,
};
use burn::prelude::*;

/// Configuration to create a [ConvTransposeNd](ConvTransposeNd) layer.
///
/// Defaults to the 2x upscaler used by the decoder (kernel 2, stride 2).
#[derive(Config, Debug)]
pub struct ConvTransposeNdConfig {
    pub channels: [usize; 2],
    #[config(default = 2)]
    pub dims: usize,
    #[config(default = 2)]
    pub kernel_size: usize,
    #[config(default = 2)]
    pub stride: usize,
}

impl ConvTransposeNdConfig {
    /// Initialize a new [ConvTransposeNd](ConvTransposeNd) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ConvTransposeNd<B>> {
        check_dims(self.dims)?;
        let [c_in, c_out] = self.channels;
        if c_in == 0 || c_out == 0 || self.kernel_size == 0 || self.stride == 0 {
            return Err(Error::InvalidLayer(format!(
                "transposed convolution needs nonzero channels, kernel and stride, got {:?} k={} s={}",
                self.channels, self.kernel_size, self.stride
            )));
        }
        let (k, s) = (self.kernel_size, self.stride);

        let mut conv = ConvTransposeNd {
            conv1d: None,
            conv2d: None,
            conv3d: None,
            dims: self.dims,
        };
        match self.dims {
            1 => {
                conv.conv1d = Some(
                    ConvTranspose1dConfig::new([c_in, c_out], k)
                        .with_stride(s)
                        .init(device),
                )
            }
            2 => {
                conv.conv2d = Some(
                    ConvTranspose2dConfig::new([c_in, c_out], [k, k])
                        .with_stride([s, s])
                        .init(device),
                )
            }
            _ => {
                conv.conv3d = Some(
                    ConvTranspose3dConfig::new([c_in, c_out], [k, k, k])
                        .with_stride([s, s, s])
                        .init(device),
                )
            }
        }
        Ok(conv)
    }
}

/// Transposed convolution over 1, 2 or 3 spatial axes.
#[derive(Module, Debug)]
pub struct ConvTransposeNd<B: Backend> {
    pub conv1d: Option<ConvTranspose1d<B>>,
    pub conv2d: Option<ConvTranspose2d<B>>,
    pub conv3d: Option<ConvTranspose3d<B>>,
    pub dims: usize,
}

impl<B: Backend> ConvTransposeNd<B> {
    /// # Shapes
    ///   - Input [batch, channels_in, ..spatial]
    ///   - Output [batch, channels_out, ..(spatial - 1) * stride + kernel]
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        debug_assert_eq!(D, self.dims + 2);
        match (&self.conv1d, &self.conv2d, &self.conv3d) {
            (Some(conv), _, _) => rerank(conv.forward(rerank::<B, D, 3>(x))),
            (_, Some(conv), _) => rerank(conv.forward(rerank::<B, D, 4>(x))),
            (_, _, Some(conv)) => rerank(conv.forward(rerank::<B, D, 5>(x))),
            _ => unreachable!("ConvTransposeNd holds one convolution"),
        }
    }
}
