mod down;
mod network;
mod up;

pub use down::{DownSample, DownSampleConfig};
pub use network::{UNet, UNetConfig, UNetPlan};
pub use up::{UpSample, UpSampleConfig};
