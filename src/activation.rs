use burn::prelude::*;
use burn::tensor::activation;

/// Nonlinearity applied after each convolution of a conv set.
#[derive(Default, Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Activation {
    #[default]
    Relu,
    LeakyRelu {
        negative_slope: f64,
    },
    Gelu,
    Silu,
    Tanh,
    Sigmoid,
}

impl Activation {
    /// # Shapes
    ///   - Input [..., any]
    ///   - Output [..., any]
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => activation::relu(x),
            Activation::LeakyRelu { negative_slope } => activation::leaky_relu(x, *negative_slope),
            Activation::Gelu => activation::gelu(x),
            Activation::Silu => activation::silu(x),
            Activation::Tanh => activation::tanh(x),
            Activation::Sigmoid => activation::sigmoid(x),
        }
    }
}
