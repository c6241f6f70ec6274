//! Attention gates over flattened feature maps.
//!
//! References:
//! - https://arxiv.org/abs/1804.03999 (Attention U-Net: Learning Where to Look for the Pancreas)
//! - https://arxiv.org/abs/1709.01507 (Squeeze-and-Excitation Networks)

use crate::error::{Error, Result};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid};

/// Configuration to create an [Attention](Attention) module.
///
/// The channel fields are assigned per level by the network builders, so the
/// values given by the user for them are only used when building an
/// [Attention](Attention) directly.
#[derive(Config, Debug)]
pub struct AttentionConfig {
    /// Channels of the gating (decoder) signal.
    #[config(default = 1)]
    pub enc_channels: usize,
    /// Channels of the gated (skip) signal.
    #[config(default = 1)]
    pub skip_channels: usize,
    /// Width of the additive spatial gate.
    #[config(default = 1)]
    pub spatial_inter_channels: usize,
    #[config(default = true)]
    pub use_spatial: bool,
    #[config(default = false)]
    pub use_channel: bool,
    /// Channel attention bottleneck ratio.
    #[config(default = 2)]
    pub channel_reduction: usize,
}

impl AttentionConfig {
    /// Copy of this config with the channel fields set for one level.
    pub fn for_level(&self, enc_channels: usize, skip_channels: usize, inter: usize) -> Self {
        self.clone()
            .with_enc_channels(enc_channels)
            .with_skip_channels(skip_channels)
            .with_spatial_inter_channels(inter)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.use_spatial && !self.use_channel {
            return Err(Error::InvalidAttention(
                "at least one of spatial or channel attention must be enabled".to_string(),
            ));
        }
        if self.enc_channels == 0 || self.skip_channels == 0 {
            return Err(Error::InvalidAttention(format!(
                "channels must be nonzero, got enc {} skip {}",
                self.enc_channels, self.skip_channels
            )));
        }
        if self.use_spatial && self.spatial_inter_channels == 0 {
            return Err(Error::InvalidAttention(
                "spatial gate needs at least one intermediate channel".to_string(),
            ));
        }
        if self.use_channel
            && (self.channel_reduction == 0 || self.skip_channels / self.channel_reduction == 0)
        {
            return Err(Error::InvalidAttention(format!(
                "channel reduction {} leaves no channels out of {}",
                self.channel_reduction, self.skip_channels
            )));
        }
        Ok(())
    }

    /// Initialize a new [Attention](Attention) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Attention<B>> {
        self.validate()?;

        let spatial = self.use_spatial.then(|| {
            let inter = self.spatial_inter_channels;
            SpatialGate {
                w_x: LinearConfig::new(self.skip_channels, inter).init(device),
                w_g: LinearConfig::new(self.enc_channels, inter)
                    .with_bias(false)
                    .init(device),
                psi: LinearConfig::new(inter, 1).init(device),
            }
        });
        let channel = self.use_channel.then(|| {
            let reduced = self.skip_channels / self.channel_reduction;
            ChannelGate {
                squeeze: LinearConfig::new(self.skip_channels, reduced).init(device),
                excite: LinearConfig::new(reduced, self.skip_channels).init(device),
            }
        });

        Ok(Attention {
            spatial,
            channel,
            enc_channels: self.enc_channels,
            skip_channels: self.skip_channels,
        })
    }
}

/// Additive attention gate producing one weight per position.
#[derive(Module, Debug)]
pub struct SpatialGate<B: Backend> {
    pub w_x: Linear<B>,
    pub w_g: Linear<B>,
    pub psi: Linear<B>,
}

impl<B: Backend> SpatialGate<B> {
    /// # Shapes
    ///   - Input `x` [batch, positions, skip_channels]
    ///   - Input `g` [batch, positions, enc_channels]
    ///   - Output [batch, positions, 1]
    fn weights(&self, x: Tensor<B, 3>, g: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = relu(self.w_x.forward(x) + self.w_g.forward(g));
        sigmoid(self.psi.forward(hidden))
    }
}

/// Squeeze-excitation gate producing one weight per channel.
#[derive(Module, Debug)]
pub struct ChannelGate<B: Backend> {
    pub squeeze: Linear<B>,
    pub excite: Linear<B>,
}

impl<B: Backend> ChannelGate<B> {
    /// # Shapes
    ///   - Input [batch, positions, channels]
    ///   - Output [batch, 1, channels]
    fn weights(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let pooled = x.mean_dim(1);
        sigmoid(self.excite.forward(relu(self.squeeze.forward(pooled))))
    }
}

/// Spatial and/or channel attention over `[batch, channels, positions]` maps.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    pub spatial: Option<SpatialGate<B>>,
    pub channel: Option<ChannelGate<B>>,
    pub enc_channels: usize,
    pub skip_channels: usize,
}

impl<B: Backend> Attention<B> {
    /// Self-gating: the input is both the gating and the gated signal.
    ///
    /// # Shapes
    ///   - Input [batch, channels, positions]
    ///   - Output [batch, channels, positions]
    pub fn forward(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [_batch, channels, _positions] = x.dims();
        if self.enc_channels != self.skip_channels {
            return Err(Error::InvalidAttention(format!(
                "self attention needs matching channels, got enc {} skip {}",
                self.enc_channels, self.skip_channels
            )));
        }
        if channels != self.skip_channels {
            return Err(Error::ChannelMismatch {
                expected: self.skip_channels,
                got: channels,
            });
        }

        let x = x.swap_dims(1, 2);
        let x = self.gate(x.clone(), x);
        Ok(x.swap_dims(1, 2))
    }

    /// Gates the encoder skip connection with the coarser decoder signal.
    ///
    /// The projected decoder signal is resampled to the skip grid by nearest
    /// neighbour along every spatial axis.
    ///
    /// # Shapes
    ///   - Input `enc` [batch, enc_channels, prod(enc_spatial)]
    ///   - Input `skip` [batch, skip_channels, prod(skip_spatial)]
    ///   - Output [batch, skip_channels, prod(skip_spatial)]
    pub fn forward_gated(
        &self,
        enc: Tensor<B, 3>,
        enc_spatial: &[usize],
        skip: Tensor<B, 3>,
        skip_spatial: &[usize],
    ) -> Result<Tensor<B, 3>> {
        let [batch, enc_channels, enc_positions] = enc.dims();
        let [skip_batch, skip_channels, skip_positions] = skip.dims();
        if enc_channels != self.enc_channels {
            return Err(Error::ChannelMismatch {
                expected: self.enc_channels,
                got: enc_channels,
            });
        }
        if skip_channels != self.skip_channels {
            return Err(Error::ChannelMismatch {
                expected: self.skip_channels,
                got: skip_channels,
            });
        }
        debug_assert_eq!(batch, skip_batch);
        debug_assert_eq!(enc_positions, enc_spatial.iter().product::<usize>());
        debug_assert_eq!(skip_positions, skip_spatial.iter().product::<usize>());

        let index = nearest_index(enc_spatial, skip_spatial);
        let index = Tensor::<B, 1, Int>::from_data(
            TensorData::new(index, [skip_positions]),
            &enc.device(),
        );
        let g = enc.select(2, index);
        debug_assert_eq!([batch, enc_channels, skip_positions], g.dims());

        let gated = self.gate(skip.swap_dims(1, 2), g.swap_dims(1, 2));
        Ok(gated.swap_dims(1, 2))
    }

    /// # Shapes
    ///   - Input `x` [batch, positions, skip_channels]
    ///   - Input `g` [batch, positions, enc_channels]
    ///   - Output [batch, positions, skip_channels]
    fn gate(&self, x: Tensor<B, 3>, g: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = match &self.spatial {
            Some(spatial) => {
                let alpha = spatial.weights(x.clone(), g);
                x * alpha
            }
            None => x,
        };
        match &self.channel {
            Some(channel) => {
                let beta = channel.weights(x.clone());
                x * beta
            }
            None => x,
        }
    }
}

/// For every position of the `target` grid (row-major), the flat index of the
/// nearest position of the `source` grid.
pub fn nearest_index(source: &[usize], target: &[usize]) -> Vec<i64> {
    debug_assert_eq!(source.len(), target.len());
    let positions = target.iter().product::<usize>();
    let mut index = Vec::with_capacity(positions);
    let mut coords = vec![0usize; target.len()];
    for _ in 0..positions {
        let mut flat = 0usize;
        for (axis, &coord) in coords.iter().enumerate() {
            let mapped = (coord * source[axis] / target[axis]).min(source[axis] - 1);
            flat = flat * source[axis] + mapped;
        }
        index.push(flat as i64);

        // row-major increment
        for axis in (0..coords.len()).rev() {
            coords[axis] += 1;
            if coords[axis] < target[axis] {
                break;
            }
            coords[axis] = 0;
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_nearest_index_1d() {
        assert_eq!(nearest_index(&[2], &[4]), vec![0, 0, 1, 1]);
        assert_eq!(nearest_index(&[2], &[5]), vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_nearest_index_2d() {
        #[rustfmt::skip]
        let expected = vec![
            0, 0, 1, 1,
            0, 0, 1, 1,
            2, 2, 3, 3,
            2, 2, 3, 3,
        ];
        assert_eq!(nearest_index(&[2, 2], &[4, 4]), expected);
    }

    #[test]
    fn test_self_attention_keeps_shape() {
        let device = Default::default();
        let attention = AttentionConfig::new()
            .for_level(8, 8, 4)
            .with_use_channel(true)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 3>::ones([2, 8, 36], &device);
        let y = attention.forward(x).unwrap();
        assert_eq!(y.dims(), [2, 8, 36]);
    }

    #[test]
    fn test_gate_scales_within_unit_interval() {
        let device = Default::default();
        let attention = AttentionConfig::new()
            .for_level(16, 8, 8)
            .init::<TestBackend>(&device)
            .unwrap();
        let enc = Tensor::<TestBackend, 3>::random(
            [2, 16, 4 * 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let skip = Tensor::<TestBackend, 3>::ones([2, 8, 8 * 8], &device);
        let gated = attention
            .forward_gated(enc, &[4, 4], skip, &[8, 8])
            .unwrap();
        assert_eq!(gated.dims(), [2, 8, 64]);

        // the skip is all ones, so the output is the gate itself
        let values = gated.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_gate_rejects_wrong_channels() {
        let device = Default::default();
        let attention = AttentionConfig::new()
            .for_level(16, 8, 8)
            .init::<TestBackend>(&device)
            .unwrap();
        let enc = Tensor::<TestBackend, 3>::zeros([1, 4, 4], &device);
        let skip = Tensor::<TestBackend, 3>::zeros([1, 8, 16], &device);
        let err = attention
            .forward_gated(enc, &[2, 2], skip, &[4, 4])
            .unwrap_err();
        assert_eq!(
            err,
            Error::ChannelMismatch {
                expected: 16,
                got: 4
            }
        );

        let x = Tensor::<TestBackend, 3>::zeros([1, 8, 16], &device);
        assert!(matches!(
            attention.forward(x),
            Err(Error::InvalidAttention(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let err = AttentionConfig::new()
            .with_use_spatial(false)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAttention(_)));

        let err = AttentionConfig::new()
            .for_level(4, 4, 0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAttention(_)));

        let err = AttentionConfig::new()
            .for_level(1, 1, 1)
            .with_use_channel(true)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAttention(_)));
    }
}
