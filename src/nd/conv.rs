use super::{check_dims, rerank};
use crate::error::{Error, Result};
use burn::module::{Content, DisplaySettings, ModuleDisplay};
use burn::nn::conv::{Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, Conv3d, Conv3dConfig};
use burn::nn::{PaddingConfig1d, PaddingConfig2d, PaddingConfig3d};
use burn::prelude::*;

/// Configuration to create a [ConvNd](ConvNd) layer.
///
/// The kernel, stride and padding are shared by every spatial axis.
#[derive(Config, Debug)]
pub struct ConvNdConfig {
    /// The number of input and output channels.
    pub channels: [usize; 2],
    pub kernel_size: usize,
    /// Spatial dimensionality.
    #[config(default = 2)]
    pub dims: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = 0)]
    pub padding: usize,
    #[config(default = true)]
    pub bias: bool,
}

impl ConvNdConfig {
    pub fn validate(&self) -> Result<()> {
        check_dims(self.dims)?;
        let [c_in, c_out] = self.channels;
        if c_in == 0 || c_out == 0 {
            return Err(Error::InvalidLayer(format!(
                "convolution channels must be nonzero, got {:?}",
                self.channels
            )));
        }
        if self.kernel_size == 0 || self.stride == 0 {
            return Err(Error::InvalidLayer(format!(
                "convolution kernel and stride must be nonzero, got kernel {} stride {}",
                self.kernel_size, self.stride
            )));
        }
        Ok(())
    }

    /// Initialize a new [ConvNd](ConvNd) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ConvNd<B>> {
        self.validate()?;
        let [c_in, c_out] = self.channels;
        let (k, s, p) = (self.kernel_size, self.stride, self.padding);

        let mut conv = ConvNd {
            conv1d: None,
            conv2d: None,
            conv3d: None,
            dims: self.dims,
        };
        match self.dims {
            1 => {
                conv.conv1d = Some(
                    Conv1dConfig::new(c_in, c_out, k)
                        .with_stride(s)
                        .with_padding(PaddingConfig1d::Explicit(p))
                        .with_bias(self.bias)
                        .init(device),
                )
            }
            2 => {
                conv.conv2d = Some(
                    Conv2dConfig::new([c_in, c_out], [k, k])
                        .with_stride([s, s])
                        .with_padding(PaddingConfig2d::Explicit(p, p))
                        .with_bias(self.bias)
                        .init(device),
                )
            }
            _ => {
                conv.conv3d = Some(
                    Conv3dConfig::new([c_in, c_out], [k, k, k])
                        .with_stride([s, s, s])
                        .with_padding(PaddingConfig3d::Explicit(p, p, p))
                        .with_bias(self.bias)
                        .init(device),
                )
            }
        }
        Ok(conv)
    }
}

/// Convolution over 1, 2 or 3 spatial axes.
///
/// Exactly one of the inner convolutions is set, matching `dims`.
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct ConvNd<B: Backend> {
    pub conv1d: Option<Conv1d<B>>,
    pub conv2d: Option<Conv2d<B>>,
    pub conv3d: Option<Conv3d<B>>,
    pub dims: usize,
}

impl<B: Backend> ConvNd<B> {
    /// # Shapes
    ///   - Input [batch, channels_in, ..spatial_in]
    ///   - Output [batch, channels_out, ..spatial_out]
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        debug_assert_eq!(D, self.dims + 2);
        match (&self.conv1d, &self.conv2d, &self.conv3d) {
            (Some(conv), _, _) => rerank(conv.forward(rerank::<B, D, 3>(x))),
            (_, Some(conv), _) => rerank(conv.forward(rerank::<B, D, 4>(x))),
            (_, _, Some(conv)) => rerank(conv.forward(rerank::<B, D, 5>(x))),
            _ => unreachable!("ConvNd holds one convolution"),
        }
    }
}

impl<B: Backend> ModuleDisplay for ConvNd<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        let content = content.add("dims", &self.dims);
        let content = match (&self.conv1d, &self.conv2d, &self.conv3d) {
            (Some(conv), _, _) => content.add("conv", conv),
            (_, Some(conv), _) => content.add("conv", conv),
            (_, _, Some(conv)) => content.add("conv", conv),
            _ => content,
        };
        content.optional()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_conv_shapes_per_dims() {
        let device = Default::default();

        let conv = ConvNdConfig::new([3, 8], 3)
            .with_dims(1)
            .with_padding(1)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 3>::zeros([2, 3, 16], &device);
        assert_eq!(conv.forward(x).dims(), [2, 8, 16]);

        let conv = ConvNdConfig::new([3, 8], 3)
            .with_padding(1)
            .with_stride(2)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        assert_eq!(conv.forward(x).dims(), [2, 8, 8, 8]);

        let conv = ConvNdConfig::new([2, 4], 1)
            .with_dims(3)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 5>::zeros([1, 2, 4, 4, 4], &device);
        assert_eq!(conv.forward(x).dims(), [1, 4, 4, 4, 4]);
    }

    #[test]
    fn test_conv_rejects_bad_config() {
        let device = Default::default();
        let err = ConvNdConfig::new([3, 8], 3)
            .with_dims(4)
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert_eq!(err, Error::UnsupportedDims(4));

        let err = ConvNdConfig::new([0, 8], 3)
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLayer(_)));
    }
}
