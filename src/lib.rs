pub mod activation;
pub mod attention;
pub mod conv_set;
pub mod embedding;
pub mod error;
pub mod nd;
#[cfg(feature = "resnet")]
pub mod resnet;
#[cfg(feature = "unet")]
pub mod unet;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::activation::Activation;
    pub use crate::attention::{Attention, AttentionConfig};
    pub use crate::conv_set::{ConvSet, ConvSetConfig};
    pub use crate::embedding::{TimeEmbedding, TimeEmbeddingConfig};
    pub use crate::error::{Error, Result};
    pub use crate::nd::{ConvNd, ConvNdConfig};

    #[cfg(feature = "resnet")]
    pub use crate::resnet::*;

    #[cfg(feature = "unet")]
    pub use crate::unet::*;
}
