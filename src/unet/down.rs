use crate::conv_set::{ConvSet, ConvSetConfig};
use crate::error::Result;
use crate::nd::{check_rank, max_pool_nd};
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct DownSampleConfig {
    pub conv: ConvSetConfig,
}

impl DownSampleConfig {
    /// Returns the initialized down sampler.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DownSample<B>> {
        Ok(DownSample {
            conv: self.conv.init(device)?,
        })
    }
}

/// Encoder level: a conv set followed by 2x max pooling.
#[derive(Module, Debug)]
pub struct DownSample<B: Backend> {
    pub conv: ConvSet<B>,
}

impl<B: Backend> DownSample<B> {
    /// Returns the pre-pool activation (the skip connection) and the pooled tensor.
    ///
    /// # Shapes
    ///   - Input [batch, channels_in, ..spatial]
    ///   - Output skip [batch, channels_out, ..spatial]
    ///   - Output encoded [batch, channels_out, ..spatial / 2]
    pub fn forward<const D: usize>(
        &self,
        x: Tensor<B, D>,
        time_embed: Option<Tensor<B, 2>>,
    ) -> Result<(Tensor<B, D>, Tensor<B, D>)> {
        check_rank::<D>(self.conv.dims)?;
        let skip = self.conv.forward(x, time_embed)?;
        let encoded = max_pool_nd(skip.clone());
        Ok((skip, encoded))
    }
}
