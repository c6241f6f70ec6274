use crate::attention::{Attention, AttentionConfig};
use crate::conv_set::{ConvSet, ConvSetConfig};
use crate::error::{Error, Result};
use crate::nd::{
    BatchNormNd, BatchNormNdConfig, ConvTransposeNd, ConvTransposeNdConfig, check_rank,
    flatten_spatial, spatial_shape,
};
use burn::nn::{Dropout, DropoutConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

#[derive(Config, Debug)]
pub struct UpSampleConfig {
    /// Merge conv set, taking the upscaled and skip channels concatenated.
    pub conv: ConvSetConfig,
    /// Channels of the incoming decoder tensor.
    pub enc_channels: usize,
    /// Channels of the skip connection, also the upscaler output.
    pub skip_channels: usize,
    /// Dropout after the upscaler, disabled at `0.0`.
    #[config(default = 0.3)]
    pub dropout: f64,
    /// Gate applied to the skip connection.
    #[config(default = "None")]
    pub attention: Option<AttentionConfig>,
}

impl UpSampleConfig {
    pub fn validate(&self) -> Result<()> {
        self.conv.validate()?;
        let merged = 2 * self.skip_channels;
        if self.conv.in_channels() != merged {
            return Err(Error::InvalidUNet(format!(
                "merge conv set must take {merged} channels (upscaled + skip), got {}",
                self.conv.in_channels()
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidUNet(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if let Some(attention) = &self.attention {
            attention.validate()?;
            if attention.enc_channels != self.enc_channels
                || attention.skip_channels != self.skip_channels
            {
                return Err(Error::InvalidAttention(format!(
                    "gate must see enc {} skip {}, configured for enc {} skip {}",
                    self.enc_channels,
                    self.skip_channels,
                    attention.enc_channels,
                    attention.skip_channels
                )));
            }
        }
        Ok(())
    }

    /// Returns the initialized up sampler.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<UpSample<B>> {
        self.validate()?;
        let attention = match &self.attention {
            Some(config) => Some(config.init(device)?),
            None => None,
        };
        let upscale = ConvTransposeNdConfig::new([self.enc_channels, self.skip_channels])
            .with_dims(self.conv.dims)
            .init(device)?;
        let norm = BatchNormNdConfig::new(self.skip_channels).init(device);
        let dropout = (self.dropout > 0.0).then(|| DropoutConfig::new(self.dropout).init());

        Ok(UpSample {
            attention,
            upscale,
            norm,
            dropout,
            conv: self.conv.init(device)?,
        })
    }
}

/// Decoder level: gates the skip connection, upscales the decoder tensor 2x and
/// merges both through a conv set.
#[derive(Module, Debug)]
pub struct UpSample<B: Backend> {
    pub attention: Option<Attention<B>>,
    pub upscale: ConvTransposeNd<B>,
    pub norm: BatchNormNd<B>,
    pub dropout: Option<Dropout>,
    pub conv: ConvSet<B>,
}

impl<B: Backend> UpSample<B> {
    /// # Shapes
    ///   - Input `cur` [batch, enc_channels, ..spatial]
    ///   - Input `skip` [batch, skip_channels, ..spatial * 2]
    ///   - Output [batch, channels_out, ..spatial * 2]
    pub fn forward<const D: usize>(
        &self,
        cur: Tensor<B, D>,
        skip: Tensor<B, D>,
        time_embed: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, D>> {
        check_rank::<D>(self.conv.dims)?;
        let skip = match &self.attention {
            Some(attention) => {
                let skip_dims = skip.dims();
                let gated = attention.forward_gated(
                    flatten_spatial(cur.clone()),
                    &spatial_shape(cur.dims()),
                    flatten_spatial(skip),
                    &spatial_shape(skip_dims),
                )?;
                gated.reshape(skip_dims)
            }
            None => skip,
        };

        let up = relu(self.norm.forward(self.upscale.forward(cur)));
        let up = match &self.dropout {
            Some(dropout) => dropout.forward(up),
            None => up,
        };
        debug_assert_eq!(spatial_shape(up.dims()), spatial_shape(skip.dims()));

        let merged = Tensor::cat(vec![up, skip], 1);
        self.conv.forward(merged, time_embed)
    }
}
