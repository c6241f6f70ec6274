use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while building or running the networks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported spatial dimensionality {0}, expected 1, 2 or 3")]
    UnsupportedDims(usize),

    #[error("expected a tensor of rank {expected} ([batch, channels, ..{dims} spatial]), got rank {got}")]
    RankMismatch {
        dims: usize,
        expected: usize,
        got: usize,
    },

    #[error("invalid conv set: {0}")]
    InvalidConvSet(String),

    #[error("invalid attention: {0}")]
    InvalidAttention(String),

    #[error("invalid unet: {0}")]
    InvalidUNet(String),

    #[error("invalid resnet: {0}")]
    InvalidResNet(String),

    #[error("invalid layer: {0}")]
    InvalidLayer(String),

    #[error("the network is time conditioned but no time step was given")]
    MissingTimeStep,

    #[error("the conv set is time conditioned but no time embedding was given")]
    MissingTimeEmbedding,

    #[error("spatial size {size} on axis {axis} is not divisible by {divisor}")]
    IndivisibleSpatialSize {
        axis: usize,
        size: usize,
        divisor: usize,
    },

    #[error("expected {expected} input channels, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("time conditioning has batch size {got}, input has {expected}")]
    BatchMismatch { expected: usize, got: usize },
}
