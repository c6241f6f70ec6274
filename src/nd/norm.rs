use burn::nn::{BatchNorm, BatchNormConfig};
use burn::prelude::*;

/// Configuration to create a [BatchNormNd](BatchNormNd) layer.
#[derive(Config, Debug)]
pub struct BatchNormNdConfig {
    pub num_features: usize,
    #[config(default = 1e-5)]
    pub epsilon: f64,
    #[config(default = 0.1)]
    pub momentum: f64,
}

impl BatchNormNdConfig {
    /// Initialize a new [BatchNormNd](BatchNormNd) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> BatchNormNd<B> {
        BatchNormNd {
            norm: BatchNormConfig::new(self.num_features)
                .with_epsilon(self.epsilon)
                .with_momentum(self.momentum)
                .init(device),
        }
    }
}

/// Batch normalization for any number of spatial axes.
///
/// Statistics are per channel over the batch and every spatial position, so the
/// spatial axes are flattened into one before delegating to burn's 1D batch norm.
#[derive(Module, Debug)]
pub struct BatchNormNd<B: Backend> {
    pub norm: BatchNorm<B, 1>,
}

impl<B: Backend> BatchNormNd<B> {
    /// # Shapes
    ///   - Input [batch, channels, ..spatial]
    ///   - Output [batch, channels, ..spatial]
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let shape = x.dims();
        let x = super::flatten_spatial(x);
        let x = self.norm.forward(x);
        x.reshape(shape)
    }
}
