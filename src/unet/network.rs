//! U-shaped encoder/decoder with optional time conditioning and attention.
//!
//! References:
//! - https://arxiv.org/abs/1505.04597 (U-Net: Convolutional Networks for Biomedical Image Segmentation)
//! - https://arxiv.org/abs/1804.03999 (Attention U-Net)

use crate::activation::Activation;
use crate::attention::{Attention, AttentionConfig};
use crate::conv_set::{ConvSet, ConvSetConfig};
use crate::embedding::{TimeEmbedding, TimeEmbeddingConfig};
use crate::error::{Error, Result};
use crate::nd::{ConvNd, ConvNdConfig, check_dims, check_rank, flatten_spatial};
use crate::unet::{DownSample, DownSampleConfig, UpSample, UpSampleConfig};
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct UNetConfig {
    /// Channels entering the first encoder level (after `in_layer`).
    pub in_channels: usize,
    /// Channels per level, the last one being the bottleneck.
    ///
    /// `channels.len() - 1` levels halve the spatial size on the way down.
    pub channels: Vec<usize>,
    #[config(default = 2)]
    pub dims: usize,
    /// Width of the sinusoidal time embedding. When set, the network is time
    /// conditioned and every conv set receives the embedding.
    #[config(default = "None")]
    pub time_embed_dim: Option<usize>,
    #[config(default = 10000.0)]
    pub time_theta: f64,
    #[config(default = 0.3)]
    pub up_dropout: f64,
    /// Bottleneck self-gating and decoder gates on the skip connections.
    #[config(default = "None")]
    pub up_attention: Option<AttentionConfig>,
    /// Self-gating after every encoder and decoder conv set.
    #[config(default = "None")]
    pub conv_attention: Option<AttentionConfig>,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
    #[config(default = false)]
    pub residual: bool,
    #[config(default = "None")]
    pub in_layer: Option<ConvNdConfig>,
    #[config(default = "None")]
    pub out_layer: Option<ConvNdConfig>,
}

/// Resolved per-level configuration of a [UNet](UNet).
#[derive(Debug, Clone)]
pub struct UNetPlan {
    /// Encoder levels, from the input resolution downwards.
    pub down: Vec<DownSampleConfig>,
    pub bottleneck: ConvSetConfig,
    pub bottleneck_attention: Option<AttentionConfig>,
    /// Decoder levels, from the bottleneck resolution upwards.
    pub up: Vec<UpSampleConfig>,
}

/// Intermediate width of self-gating attention over `channels`.
fn half_width(channels: usize) -> usize {
    (channels / 2).max(1)
}

impl UNetConfig {
    /// Number of 2x pooling steps, so spatial sizes must divide `2^levels`.
    pub fn levels(&self) -> usize {
        self.channels.len().saturating_sub(1)
    }

    fn conv_set(&self, channels: Vec<usize>) -> ConvSetConfig {
        ConvSetConfig::new(channels, vec![3, 3], vec![1, 1])
            .with_dims(self.dims)
            .with_activation(self.activation)
            .with_time_embed_dim(self.time_embed_dim)
            .with_residual(self.residual)
    }

    /// Resolves the channel sequences and attention channels of every level.
    pub fn plan(&self) -> Result<UNetPlan> {
        check_dims(self.dims)?;
        let c = &self.channels;
        if c.len() < 2 {
            return Err(Error::InvalidUNet(format!(
                "needs at least two channel entries (one level and the bottleneck), got {c:?}"
            )));
        }
        if self.in_channels == 0 || c.contains(&0) {
            return Err(Error::InvalidUNet(format!(
                "channels must be nonzero, got in {} and {c:?}",
                self.in_channels
            )));
        }
        let last = c.len() - 1;

        let down = (0..last)
            .map(|i| {
                let c_in = if i == 0 { self.in_channels } else { c[i - 1] };
                let attention = self
                    .conv_attention
                    .as_ref()
                    .map(|a| a.for_level(c[i], c[i], half_width(c[i])));
                DownSampleConfig::new(
                    self.conv_set(vec![c_in, c[i], c[i]])
                        .with_attention(attention),
                )
            })
            .collect();

        let bottleneck = self.conv_set(vec![c[last - 1], c[last], c[last]]);
        let bottleneck_attention = self
            .up_attention
            .as_ref()
            .map(|a| a.for_level(c[last], c[last], half_width(c[last])));

        let up = (1..=last)
            .rev()
            .map(|i| {
                let skip = c[i - 1];
                let gate = match &self.up_attention {
                    Some(a) if i > 1 => Some(a.for_level(c[i], skip, skip)),
                    _ => None,
                };
                let attention = self
                    .conv_attention
                    .as_ref()
                    .map(|a| a.for_level(skip, skip, half_width(skip)));
                UpSampleConfig::new(
                    self.conv_set(vec![2 * skip, skip, skip])
                        .with_attention(attention),
                    c[i],
                    skip,
                )
                .with_dropout(self.up_dropout)
                .with_attention(gate)
            })
            .collect();

        Ok(UNetPlan {
            down,
            bottleneck,
            bottleneck_attention,
            up,
        })
    }

    fn check_layers(&self) -> Result<()> {
        if let Some(layer) = &self.in_layer {
            layer.validate()?;
            if layer.dims != self.dims || layer.channels[1] != self.in_channels {
                return Err(Error::InvalidUNet(format!(
                    "in layer must output {} channels over {} dims, got {} over {}",
                    self.in_channels, self.dims, layer.channels[1], layer.dims
                )));
            }
        }
        if let Some(layer) = &self.out_layer {
            layer.validate()?;
            let c_0 = self.channels[0];
            if layer.dims != self.dims || layer.channels[0] != c_0 {
                return Err(Error::InvalidUNet(format!(
                    "out layer must take {c_0} channels over {} dims, got {} over {}",
                    self.dims, layer.channels[0], layer.dims
                )));
            }
        }
        Ok(())
    }

    /// Returns the initialized network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<UNet<B>> {
        let plan = self.plan()?;
        self.check_layers()?;

        for (i, level) in plan.down.iter().enumerate() {
            log::debug!("unet down {i}: {:?}", level.conv.channels);
        }
        log::debug!(
            "unet bottleneck: {:?} attention {}",
            plan.bottleneck.channels,
            plan.bottleneck_attention.is_some()
        );
        for (i, level) in plan.up.iter().enumerate() {
            log::debug!(
                "unet up {i}: {} -> {:?} gate {}",
                level.enc_channels,
                level.conv.channels,
                level.attention.is_some()
            );
        }

        let time_embedding = match self.time_embed_dim {
            Some(dim) => Some(
                TimeEmbeddingConfig::new(dim)
                    .with_theta(self.time_theta)
                    .init(device)?,
            ),
            None => None,
        };
        let down = plan
            .down
            .iter()
            .map(|level| level.init(device))
            .collect::<Result<Vec<_>>>()?;
        let bottleneck = plan.bottleneck.init(device)?;
        let bottleneck_attention = match &plan.bottleneck_attention {
            Some(config) => Some(config.init(device)?),
            None => None,
        };
        let up = plan
            .up
            .iter()
            .map(|level| level.init(device))
            .collect::<Result<Vec<_>>>()?;
        let in_layer = match &self.in_layer {
            Some(config) => Some(config.init(device)?),
            None => None,
        };
        let out_layer = match &self.out_layer {
            Some(config) => Some(config.init(device)?),
            None => None,
        };

        let unet = UNet {
            in_layer,
            time_embedding,
            down,
            bottleneck,
            bottleneck_attention,
            up,
            out_layer,
            dims: self.dims,
        };
        log::info!(
            "unet: {} levels over {} spatial dims, {} parameters",
            self.levels(),
            self.dims,
            unet.num_params()
        );
        Ok(unet)
    }
}

#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    pub in_layer: Option<ConvNd<B>>,
    pub time_embedding: Option<TimeEmbedding<B>>,
    pub down: Vec<DownSample<B>>,
    pub bottleneck: ConvSet<B>,
    pub bottleneck_attention: Option<Attention<B>>,
    pub up: Vec<UpSample<B>>,
    pub out_layer: Option<ConvNd<B>>,
    pub dims: usize,
}

impl<B: Backend> UNet<B> {
    pub fn is_time_conditioned(&self) -> bool {
        self.time_embedding.is_some()
    }

    /// # Shapes
    ///   - Input `x` [batch, channels, ..spatial]
    ///   - Input `time_steps` [batch]
    ///   - Output [batch, channels_out, ..spatial]
    pub fn forward<const D: usize>(
        &self,
        x: Tensor<B, D>,
        time_steps: Option<Tensor<B, 1>>,
    ) -> Result<Tensor<B, D>> {
        check_rank::<D>(self.dims)?;
        let mut cur = match &self.in_layer {
            Some(layer) => layer.forward(x),
            None => x,
        };

        let divisor = 1usize << self.down.len();
        for (axis, &size) in cur.dims()[2..].iter().enumerate() {
            if size % divisor != 0 {
                return Err(Error::IndivisibleSpatialSize {
                    axis,
                    size,
                    divisor,
                });
            }
        }

        let time_embed = match &self.time_embedding {
            Some(embedding) => {
                let time_steps = time_steps.ok_or(Error::MissingTimeStep)?;
                let [batch, steps] = [cur.dims()[0], time_steps.dims()[0]];
                if steps != batch {
                    return Err(Error::BatchMismatch {
                        expected: batch,
                        got: steps,
                    });
                }
                Some(embedding.forward(time_steps))
            }
            None => None,
        };

        let mut skips = Vec::with_capacity(self.down.len());
        for down in self.down.iter() {
            let (skip, encoded) = down.forward(cur, time_embed.clone())?;
            skips.push(skip);
            cur = encoded;
        }

        cur = self.bottleneck.forward(cur, time_embed.clone())?;
        if let Some(attention) = &self.bottleneck_attention {
            let shape = cur.dims();
            cur = attention.forward(flatten_spatial(cur))?.reshape(shape);
        }

        for (up, skip) in self.up.iter().zip(skips.into_iter().rev()) {
            cur = up.forward(cur, skip, time_embed.clone())?;
        }

        Ok(match &self.out_layer {
            Some(layer) => layer.forward(cur),
            None => cur,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_plan_channel_bookkeeping() {
        let config = UNetConfig::new(3, vec![8, 16, 32])
            .with_up_attention(Some(AttentionConfig::new()))
            .with_conv_attention(Some(AttentionConfig::new()));
        let plan = config.plan().unwrap();

        let down: Vec<_> = plan.down.iter().map(|d| d.conv.channels.clone()).collect();
        assert_eq!(down, vec![vec![3, 8, 8], vec![8, 16, 16]]);
        assert_eq!(plan.bottleneck.channels, vec![16, 32, 32]);
        assert!(plan.bottleneck.attention.is_none());

        let bottleneck_attention = plan.bottleneck_attention.unwrap();
        assert_eq!(
            (
                bottleneck_attention.enc_channels,
                bottleneck_attention.skip_channels,
                bottleneck_attention.spatial_inter_channels
            ),
            (32, 32, 16)
        );

        let up: Vec<_> = plan.up.iter().map(|u| u.conv.channels.clone()).collect();
        assert_eq!(up, vec![vec![32, 16, 16], vec![16, 8, 8]]);

        // gate on every decoder level except the last one
        let gate = plan.up[0].attention.as_ref().unwrap();
        assert_eq!(
            (gate.enc_channels, gate.skip_channels, gate.spatial_inter_channels),
            (32, 16, 16)
        );
        assert!(plan.up[1].attention.is_none());

        let conv_attention = plan.up[1].conv.attention.as_ref().unwrap();
        assert_eq!(conv_attention.spatial_inter_channels, 4);
        let conv_attention = plan.down[1].conv.attention.as_ref().unwrap();
        assert_eq!(conv_attention.enc_channels, 16);
        assert_eq!(conv_attention.spatial_inter_channels, 8);
    }

    #[test]
    fn test_plan_rejects_single_level() {
        let config = UNetConfig::new(3, vec![8]);
        assert!(matches!(config.plan(), Err(Error::InvalidUNet(_))));
        let config = UNetConfig::new(3, vec![8, 16]).with_dims(0);
        assert!(matches!(config.plan(), Err(Error::UnsupportedDims(0))));
    }

    #[test]
    fn test_unet_2d() {
        init_logger();
        let device = Default::default();
        let unet = UNetConfig::new(3, vec![4, 8, 16])
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(unet.down.len(), 2);
        assert_eq!(unet.up.len(), 2);
        assert!(!unet.is_time_conditioned());

        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        let y = unet.forward(x, None).unwrap();
        assert_eq!(y.dims(), [2, 4, 16, 16]);
    }

    #[test]
    fn test_unet_1d_time_conditioned_with_attention() {
        init_logger();
        let device = Default::default();
        let unet = UNetConfig::new(1, vec![4, 8, 16, 32])
            .with_dims(1)
            .with_time_embed_dim(Some(16))
            .with_up_attention(Some(AttentionConfig::new()))
            .with_conv_attention(Some(AttentionConfig::new().with_use_channel(true)))
            .with_residual(true)
            .with_out_layer(Some(ConvNdConfig::new([4, 2], 1).with_dims(1)))
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(unet.is_time_conditioned());
        assert!(unet.bottleneck_attention.is_some());

        let x = Tensor::<TestBackend, 3>::ones([2, 1, 32], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([10.0, 500.0], &device);
        let y = unet.forward(x, Some(t)).unwrap();
        assert_eq!(y.dims(), [2, 2, 32]);
    }

    #[test]
    fn test_unet_3d_with_in_layer() {
        let device = Default::default();
        let unet = UNetConfig::new(4, vec![4, 8])
            .with_dims(3)
            .with_up_dropout(0.0)
            .with_in_layer(Some(
                ConvNdConfig::new([1, 4], 3).with_dims(3).with_padding(1),
            ))
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 5>::zeros([1, 1, 4, 4, 4], &device);
        let y = unet.forward(x, None).unwrap();
        assert_eq!(y.dims(), [1, 4, 4, 4, 4]);
    }

    #[test]
    fn test_time_steps_change_output() {
        let device = Default::default();
        let unet = UNetConfig::new(2, vec![4, 8, 16])
            .with_time_embed_dim(Some(8))
            .with_up_dropout(0.0)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 4>::random([1, 2, 8, 8], Distribution::Default, &device);
        let early = Tensor::<TestBackend, 1>::from_floats([1.0], &device);
        let late = Tensor::<TestBackend, 1>::from_floats([500.0], &device);

        let y_early = unet.forward(x.clone(), Some(early)).unwrap();
        let y_late = unet.forward(x, Some(late)).unwrap();
        let diff: f32 = (y_early - y_late).abs().max().into_scalar();
        assert!(diff > 1e-4, "time step had no effect ({diff})");
    }

    #[test]
    fn test_unet_runtime_errors() {
        let device = Default::default();
        let unet = UNetConfig::new(1, vec![2, 4, 8])
            .with_time_embed_dim(Some(4))
            .init::<TestBackend>(&device)
            .unwrap();

        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 8, 8], &device);
        assert_eq!(unet.forward(x, None).unwrap_err(), Error::MissingTimeStep);

        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 8, 6], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([1.0], &device);
        assert_eq!(
            unet.forward(x, Some(t)).unwrap_err(),
            Error::IndivisibleSpatialSize {
                axis: 1,
                size: 6,
                divisor: 4
            }
        );

        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 8, 8], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device);
        assert_eq!(
            unet.forward(x, Some(t)).unwrap_err(),
            Error::BatchMismatch {
                expected: 1,
                got: 2
            }
        );

        let x = Tensor::<TestBackend, 3>::zeros([1, 1, 8], &device);
        assert_eq!(
            unet.forward(x, None).unwrap_err(),
            Error::RankMismatch {
                dims: 2,
                expected: 4,
                got: 3
            }
        );
    }

    #[test]
    fn test_layer_validation() {
        let device = Default::default();
        let err = UNetConfig::new(3, vec![4, 8])
            .with_in_layer(Some(ConvNdConfig::new([1, 5], 1)))
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUNet(_)));

        let err = UNetConfig::new(3, vec![4, 8])
            .with_out_layer(Some(ConvNdConfig::new([4, 1], 1).with_dims(1)))
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUNet(_)));
    }

    #[test]
    fn test_gradients_reach_every_level() {
        let device = Default::default();
        let unet = UNetConfig::new(1, vec![2, 4, 8])
            .with_time_embed_dim(Some(4))
            .with_up_dropout(0.0)
            .init::<TestAutodiffBackend>(&device)
            .unwrap();

        let x = Tensor::<TestAutodiffBackend, 4>::random(
            [2, 1, 8, 8],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let t = Tensor::<TestAutodiffBackend, 1>::from_floats([3.0, 40.0], &device);
        let loss = unet.forward(x, Some(t)).unwrap().powf_scalar(2.0).mean();
        let grads = loss.backward();

        let first = unet.down[0].conv.stages[0].conv.conv2d.as_ref().unwrap();
        assert!(first.weight.grad(&grads).is_some());
        let time = unet.time_embedding.as_ref().unwrap();
        assert!(time.linear.weight.grad(&grads).is_some());
        let upscale = unet.up[1].upscale.conv2d.as_ref().unwrap();
        assert!(upscale.weight.grad(&grads).is_some());
    }

    #[test]
    fn test_config_round_trip_through_json() {
        let config = UNetConfig::new(3, vec![8, 16])
            .with_time_embed_dim(Some(32))
            .with_activation(Activation::LeakyRelu {
                negative_slope: 0.2,
            })
            .with_conv_attention(Some(AttentionConfig::new().with_use_channel(true)));
        let json = config.to_string();
        let loaded = UNetConfig::load_binary(json.as_bytes()).unwrap();
        assert_eq!(loaded.channels, vec![8, 16]);
        assert_eq!(loaded.time_embed_dim, Some(32));
        assert_eq!(
            loaded.activation,
            Activation::LeakyRelu {
                negative_slope: 0.2
            }
        );
        assert!(loaded.conv_attention.unwrap().use_channel);
    }
}
