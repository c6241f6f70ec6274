//! Sinusoidal diffusion time step embeddings.
//!
//! References:
//! - https://arxiv.org/abs/2006.11239 (Denoising Diffusion Probabilistic Models)
//! - https://arxiv.org/abs/1706.03762 (Attention Is All You Need, positional encodings)

use crate::error::{Error, Result};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Sinusoidal frequencies `exp(-ln(theta) * i / (half - 1))` for `i in 0..half`.
pub fn sinusoidal_freqs<B: Backend>(dim: usize, theta: f64, device: &B::Device) -> Tensor<B, 1> {
    let half = dim / 2;
    let scale = theta.ln() / (half.saturating_sub(1).max(1)) as f64;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(i as f64) * scale).exp() as f32)
        .collect();
    Tensor::<B, 1>::from_data(TensorData::new(freqs, [half]), device)
}

/// Embeds each time step as `[sin(t * f) | cos(t * f)]`.
///
/// An odd `dim` gets a trailing zero column.
///
/// # Shapes
///   - Input [batch]
///   - Output [batch, dim]
pub fn sinusoidal_embedding<B: Backend>(
    timesteps: Tensor<B, 1>,
    dim: usize,
    theta: f64,
) -> Tensor<B, 2> {
    let [batch] = timesteps.dims();
    let device = timesteps.device();
    let freqs = sinusoidal_freqs::<B>(dim, theta, &device);
    let half = dim / 2;

    let args = timesteps.reshape([batch, 1]) * freqs.reshape([1, half]);
    let mut parts = vec![args.clone().sin(), args.cos()];
    if dim % 2 == 1 {
        parts.push(Tensor::zeros([batch, 1], &device));
    }
    let embed = Tensor::cat(parts, 1);
    debug_assert_eq!([batch, dim], embed.dims());
    embed
}

/// Configuration to create a [TimeEmbedding](TimeEmbedding) layer.
#[derive(Config, Debug)]
pub struct TimeEmbeddingConfig {
    /// Embedding width, also the width seen by every conv set.
    pub dim: usize,
    #[config(default = 10000.0)]
    pub theta: f64,
}

impl TimeEmbeddingConfig {
    /// Initialize a new [TimeEmbedding](TimeEmbedding) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TimeEmbedding<B>> {
        if self.dim < 2 {
            return Err(Error::InvalidLayer(format!(
                "time embedding width must be at least 2, got {}",
                self.dim
            )));
        }
        if self.theta <= 1.0 {
            return Err(Error::InvalidLayer(format!(
                "time embedding theta must be above 1, got {}",
                self.theta
            )));
        }
        Ok(TimeEmbedding {
            linear: LinearConfig::new(self.dim, self.dim).init(device),
            dim: self.dim,
            theta: self.theta,
        })
    }
}

/// Sinusoidal embedding followed by a learned projection and ReLU.
#[derive(Module, Debug)]
pub struct TimeEmbedding<B: Backend> {
    pub linear: Linear<B>,
    pub dim: usize,
    pub theta: f64,
}

impl<B: Backend> TimeEmbedding<B> {
    /// # Shapes
    ///   - Input [batch]
    ///   - Output [batch, dim]
    pub fn forward(&self, timesteps: Tensor<B, 1>) -> Tensor<B, 2> {
        let embed = sinusoidal_embedding(timesteps, self.dim, self.theta);
        relu(self.linear.forward(embed))
    }
}
