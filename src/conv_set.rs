use crate::activation::Activation;
use crate::attention::{Attention, AttentionConfig};
use crate::error::{Error, Result};
use crate::nd::{
    BatchNormNd, BatchNormNdConfig, ConvNd, ConvNdConfig, check_dims, check_rank,
    expand_spatial, flatten_spatial,
};
use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration to create a [ConvSet](ConvSet).
///
/// `channels` lists the channel count before and after every convolution, so
/// a set has `channels.len() - 1` stages, each with its own kernel and padding.
#[derive(Config, Debug)]
pub struct ConvSetConfig {
    pub channels: Vec<usize>,
    pub kernels: Vec<usize>,
    pub paddings: Vec<usize>,
    #[config(default = 2)]
    pub dims: usize,
    /// Stride of the second convolution (and of the residual projection).
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
    /// Width of the time embedding, when time conditioned.
    #[config(default = "None")]
    pub time_embed_dim: Option<usize>,
    /// Self-gating attention applied after the convolutions.
    #[config(default = "None")]
    pub attention: Option<AttentionConfig>,
    #[config(default = false)]
    pub residual: bool,
}

impl ConvSetConfig {
    /// Two 3x3 "same" convolutions, `[in, out, out]`.
    pub fn double(in_channels: usize, out_channels: usize) -> Self {
        Self::new(
            vec![in_channels, out_channels, out_channels],
            vec![3, 3],
            vec![1, 1],
        )
    }

    pub fn in_channels(&self) -> usize {
        self.channels.first().copied().unwrap_or_default()
    }

    pub fn out_channels(&self) -> usize {
        self.channels.last().copied().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        check_dims(self.dims)?;
        let invalid = |msg: String| Err(Error::InvalidConvSet(msg));

        if self.channels.len() < 3 {
            return invalid(format!(
                "needs at least three channel entries, got {:?}",
                self.channels
            ));
        }
        if self.kernels.len() < 2 || self.paddings.len() < 2 {
            return invalid(format!(
                "needs at least two kernels and paddings, got {:?} and {:?}",
                self.kernels, self.paddings
            ));
        }
        if self.kernels.len() != self.channels.len() - 1
            || self.paddings.len() != self.channels.len() - 1
        {
            return invalid(format!(
                "kernels ({}) and paddings ({}) must number one less than channels ({})",
                self.kernels.len(),
                self.paddings.len(),
                self.channels.len()
            ));
        }
        if self.channels.contains(&0) || self.kernels.contains(&0) {
            return invalid(format!(
                "channels and kernels must be nonzero, got {:?} and {:?}",
                self.channels, self.kernels
            ));
        }
        if self.stride == 0 {
            return invalid("stride must be nonzero".to_string());
        }
        if self.residual {
            // the shortcut is a strided 1x1 convolution, so the main path must keep sizes
            let mismatched = self
                .kernels
                .iter()
                .zip(&self.paddings)
                .find(|(k, p)| **k != 2 * **p + 1);
            if let Some((k, p)) = mismatched {
                return invalid(format!(
                    "residual sets need size-preserving stages, got kernel {k} with padding {p}"
                ));
            }
        }
        if let Some(0) = self.time_embed_dim {
            return invalid("time embedding width must be nonzero".to_string());
        }
        if let Some(attention) = &self.attention {
            attention.validate()?;
            let out = self.out_channels();
            if attention.enc_channels != out || attention.skip_channels != out {
                return Err(Error::InvalidAttention(format!(
                    "conv set attention must see {out} channels, configured for enc {} skip {}",
                    attention.enc_channels, attention.skip_channels
                )));
            }
        }
        Ok(())
    }

    /// Returns the initialized conv set.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ConvSet<B>> {
        self.validate()?;

        let mut stages = Vec::with_capacity(self.channels.len() - 1);
        for (i, pair) in self.channels.windows(2).enumerate() {
            let stride = if i == 1 { self.stride } else { 1 };
            let conv = ConvNdConfig::new([pair[0], pair[1]], self.kernels[i])
                .with_dims(self.dims)
                .with_stride(stride)
                .with_padding(self.paddings[i])
                .init(device)?;
            let norm = BatchNormNdConfig::new(pair[1]).init(device);
            stages.push(ConvStage { conv, norm });
        }

        let time_proj = self
            .time_embed_dim
            .map(|dim| LinearConfig::new(dim, self.channels[1]).init(device));

        let attention = match &self.attention {
            Some(config) => Some(config.init(device)?),
            None => None,
        };

        let residual = if self.residual {
            let conv = ConvNdConfig::new([self.in_channels(), self.out_channels()], 1)
                .with_dims(self.dims)
                .with_stride(self.stride)
                .init(device)?;
            let norm = BatchNormNdConfig::new(self.out_channels()).init(device);
            Some(Shortcut { conv, norm })
        } else {
            None
        };

        log::debug!(
            "conv set {:?} kernels {:?} paddings {:?} stride {} time {:?} attention {} residual {}",
            self.channels,
            self.kernels,
            self.paddings,
            self.stride,
            self.time_embed_dim,
            attention.is_some(),
            residual.is_some(),
        );

        Ok(ConvSet {
            stages,
            time_proj,
            attention,
            residual,
            activation: Ignored(self.activation),
            in_channels: self.in_channels(),
            dims: self.dims,
        })
    }
}

/// Convolution followed by batch normalization.
#[derive(Module, Debug)]
pub struct ConvStage<B: Backend> {
    pub conv: ConvNd<B>,
    pub norm: BatchNormNd<B>,
}

impl<B: Backend> ConvStage<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// 1x1 projection matching the input to the output of a residual set.
#[derive(Module, Debug)]
pub struct Shortcut<B: Backend> {
    pub conv: ConvNd<B>,
    pub norm: BatchNormNd<B>,
}

/// A chain of convolution + batch norm + activation stages, with optional time
/// conditioning after the first stage, self-gating attention after the last
/// one, and a residual shortcut around the whole chain.
#[derive(Module, Debug)]
pub struct ConvSet<B: Backend> {
    pub stages: Vec<ConvStage<B>>,
    /// Projects the time embedding onto the channels of the first stage.
    pub time_proj: Option<Linear<B>>,
    pub attention: Option<Attention<B>>,
    pub residual: Option<Shortcut<B>>,
    pub activation: Ignored<Activation>,
    pub in_channels: usize,
    pub dims: usize,
}

impl<B: Backend> ConvSet<B> {
    pub fn is_time_conditioned(&self) -> bool {
        self.time_proj.is_some()
    }

    /// # Shapes
    ///   - Input `x` [batch, channels[0], ..spatial]
    ///   - Input `time_embed` [batch, time_embed_dim]
    ///   - Output [batch, channels[last], ..spatial / stride]
    pub fn forward<const D: usize>(
        &self,
        x: Tensor<B, D>,
        time_embed: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, D>> {
        check_rank::<D>(self.dims)?;
        let [batch, channels] = [x.dims()[0], x.dims()[1]];
        if channels != self.in_channels {
            return Err(Error::ChannelMismatch {
                expected: self.in_channels,
                got: channels,
            });
        }
        let activation = *self.activation;

        let time = match &self.time_proj {
            Some(time_proj) => {
                let time_embed = time_embed.ok_or(Error::MissingTimeEmbedding)?;
                let time_batch = time_embed.dims()[0];
                if time_batch != batch {
                    return Err(Error::BatchMismatch {
                        expected: batch,
                        got: time_batch,
                    });
                }
                let time = relu(time_proj.forward(time_embed));
                Some(expand_spatial::<B, D>(time))
            }
            None => None,
        };

        let mut out = x.clone();
        for (i, stage) in self.stages.iter().enumerate() {
            out = activation.forward(stage.forward(out));
            if i == 0 {
                if let Some(time) = &time {
                    out = out + time.clone();
                }
            }
        }

        if let Some(attention) = &self.attention {
            let shape = out.dims();
            out = attention.forward(flatten_spatial(out))?.reshape(shape);
        }

        if let Some(shortcut) = &self.residual {
            let res = shortcut.norm.forward(shortcut.conv.forward(x));
            debug_assert_eq!(res.dims(), out.dims());
            out = relu(out + res);
        }

        Ok(out)
    }
}
