//! Residual convolutional network built from stages of conv sets.
//!
//! References:
//! - https://arxiv.org/abs/1512.03385 (Deep Residual Learning for Image Recognition)

use crate::activation::Activation;
use crate::attention::AttentionConfig;
use crate::conv_set::{ConvSet, ConvSetConfig};
use crate::embedding::{TimeEmbedding, TimeEmbeddingConfig};
use crate::error::{Error, Result};
use crate::nd::{ConvNd, ConvNdConfig, check_dims, check_rank};
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Channel sequence of the conv sets of each stage.
    pub channels: Vec<Vec<usize>>,
    /// Kernel sequence of the conv sets of each stage.
    pub kernels: Vec<Vec<usize>>,
    /// Padding sequence of the conv sets of each stage.
    pub paddings: Vec<Vec<usize>>,
    /// Number of conv sets in each stage.
    pub blocks: Vec<usize>,
    #[config(default = 2)]
    pub dims: usize,
    #[config(default = "None")]
    pub time_embed_dim: Option<usize>,
    #[config(default = 10000.0)]
    pub time_theta: f64,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
    #[config(default = "None")]
    pub conv_attention: Option<AttentionConfig>,
    #[config(default = false)]
    pub residual: bool,
    #[config(default = "None")]
    pub in_layer: Option<ConvNdConfig>,
    #[config(default = "None")]
    pub out_layer: Option<ConvNdConfig>,
}

/// Resolved conv sets of a [ResNet](ResNet), grouped by stage.
#[derive(Debug, Clone)]
pub struct ResNetPlan {
    pub stages: Vec<Vec<ConvSetConfig>>,
}

impl ResNetPlan {
    pub fn num_blocks(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }
}

impl ResNetConfig {
    /// Bottleneck stages in the style of ResNet-50: `[in, width, width, out]`
    /// with kernels `1, 3, 1`.
    ///
    /// Each tuple is `(in, width, out, blocks)`. Only the first stage reads
    /// `in`; later stages chain from the previous `out`.
    pub fn bottleneck(stages: &[(usize, usize, usize, usize)]) -> Self {
        let mut channels = Vec::with_capacity(stages.len());
        let mut blocks = Vec::with_capacity(stages.len());
        let mut c_in = None;
        for &(first_in, width, out, count) in stages {
            let stage_in = c_in.unwrap_or(first_in);
            channels.push(vec![stage_in, width, width, out]);
            blocks.push(count);
            c_in = Some(out);
        }
        let kernels = vec![vec![1, 3, 1]; stages.len()];
        let paddings = vec![vec![0, 1, 0]; stages.len()];
        Self::new(channels, kernels, paddings, blocks)
    }

    /// Resolves every conv set, stage by stage.
    pub fn plan(&self) -> Result<ResNetPlan> {
        check_dims(self.dims)?;
        let stages = self.channels.len();
        if stages == 0 {
            return Err(Error::InvalidResNet("needs at least one stage".to_string()));
        }
        if self.kernels.len() != stages
            || self.paddings.len() != stages
            || self.blocks.len() != stages
        {
            return Err(Error::InvalidResNet(format!(
                "channels ({}), kernels ({}), paddings ({}) and blocks ({}) must have the same length",
                stages,
                self.kernels.len(),
                self.paddings.len(),
                self.blocks.len()
            )));
        }

        let mut plan = Vec::with_capacity(stages);
        let mut prev_out: Option<usize> = None;
        for s in 0..stages {
            let channels = &self.channels[s];
            if self.blocks[s] == 0 {
                return Err(Error::InvalidResNet(format!("stage {s} has no blocks")));
            }
            let (Some(&first), Some(&last)) = (channels.first(), channels.last()) else {
                return Err(Error::InvalidResNet(format!("stage {s} has no channels")));
            };
            if let Some(prev) = prev_out {
                if first != prev {
                    return Err(Error::InvalidResNet(format!(
                        "stage {s} takes {first} channels but the previous stage outputs {prev}"
                    )));
                }
            }
            prev_out = Some(last);

            let stride = if s == 0 { 1 } else { 2 };
            let attention = self
                .conv_attention
                .as_ref()
                .map(|a| a.for_level(last, last, (last / 2).max(1)));
            let base = ConvSetConfig::new(
                channels.clone(),
                self.kernels[s].clone(),
                self.paddings[s].clone(),
            )
            .with_dims(self.dims)
            .with_activation(self.activation)
            .with_time_embed_dim(self.time_embed_dim)
            .with_attention(attention)
            .with_residual(self.residual);

            let mut repeated = channels.clone();
            repeated[0] = last;

            let mut sets = Vec::with_capacity(self.blocks[s]);
            sets.push(base.clone().with_stride(stride));
            for _ in 1..self.blocks[s] {
                let mut set = base.clone();
                set.channels = repeated.clone();
                sets.push(set);
            }
            for set in &sets {
                set.validate()?;
            }
            plan.push(sets);
        }
        Ok(ResNetPlan { stages: plan })
    }

    fn check_layers(&self) -> Result<()> {
        if let Some(layer) = &self.in_layer {
            layer.validate()?;
            let expected = self.channels[0][0];
            if layer.dims != self.dims || layer.channels[1] != expected {
                return Err(Error::InvalidResNet(format!(
                    "in layer must output {expected} channels over {} dims, got {} over {}",
                    self.dims, layer.channels[1], layer.dims
                )));
            }
        }
        if let Some(layer) = &self.out_layer {
            layer.validate()?;
            let expected = self
                .channels
                .last()
                .and_then(|c| c.last())
                .copied()
                .unwrap_or_default();
            if layer.dims != self.dims || layer.channels[0] != expected {
                return Err(Error::InvalidResNet(format!(
                    "out layer must take {expected} channels over {} dims, got {} over {}",
                    self.dims, layer.channels[0], layer.dims
                )));
            }
        }
        Ok(())
    }

    /// Returns the initialized network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResNet<B>> {
        let plan = self.plan()?;
        self.check_layers()?;

        let mut stages = Vec::with_capacity(plan.stages.len());
        for (s, sets) in plan.stages.iter().enumerate() {
            log::debug!(
                "resnet stage {s}: {} x {:?} stride {}",
                sets.len(),
                sets[0].channels,
                sets[0].stride
            );
            let blocks = sets
                .iter()
                .map(|set| set.init(device))
                .collect::<Result<Vec<_>>>()?;
            stages.push(ResNetStage { blocks });
        }

        let time_embedding = match self.time_embed_dim {
            Some(dim) => Some(
                TimeEmbeddingConfig::new(dim)
                    .with_theta(self.time_theta)
                    .init(device)?,
            ),
            None => None,
        };
        let in_layer = match &self.in_layer {
            Some(config) => Some(config.init(device)?),
            None => None,
        };
        let out_layer = match &self.out_layer {
            Some(config) => Some(config.init(device)?),
            None => None,
        };

        let resnet = ResNet {
            in_layer,
            time_embedding,
            stages,
            out_layer,
            dims: self.dims,
        };
        log::info!(
            "resnet: {} stages, {} blocks over {} spatial dims, {} parameters",
            plan.stages.len(),
            plan.num_blocks(),
            self.dims,
            resnet.num_params()
        );
        Ok(resnet)
    }
}

#[derive(Module, Debug)]
pub struct ResNetStage<B: Backend> {
    pub blocks: Vec<ConvSet<B>>,
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub in_layer: Option<ConvNd<B>>,
    pub time_embedding: Option<TimeEmbedding<B>>,
    pub stages: Vec<ResNetStage<B>>,
    pub out_layer: Option<ConvNd<B>>,
    pub dims: usize,
}

impl<B: Backend> ResNet<B> {
    pub fn is_time_conditioned(&self) -> bool {
        self.time_embedding.is_some()
    }

    /// # Shapes
    ///   - Input `x` [batch, channels, ..spatial]
    ///   - Input `time_steps` [batch]
    ///   - Output [batch, channels_out, ..spatial / 2^(stages - 1)]
    pub fn forward<const D: usize>(
        &self,
        x: Tensor<B, D>,
        time_steps: Option<Tensor<B, 1>>,
    ) -> Result<Tensor<B, D>> {
        check_rank::<D>(self.dims)?;

        let mut x = match &self.in_layer {
            Some(layer) => layer.forward(x),
            None => x,
        };

        let time_embed = match &self.time_embedding {
            Some(embedding) => {
                let time_steps = time_steps.ok_or(Error::MissingTimeStep)?;
                let [batch, steps] = [x.dims()[0], time_steps.dims()[0]];
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

        for stage in self.stages.iter() {
            for block in stage.blocks.iter() {
                x = block.forward(x, time_embed.clone())?;
            }
        }

        Ok(match &self.out_layer {
            Some(layer) => layer.forward(x),
            None => x,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn basic_config() -> ResNetConfig {
        ResNetConfig::new(
            vec![vec![3, 8, 8], vec![8, 16, 16]],
            vec![vec![3, 3], vec![3, 3]],
            vec![vec![1, 1], vec![1, 1]],
            vec![2, 2],
        )
        .with_residual(true)
    }

    #[test]
    fn test_plan_strides_and_repeats() {
        let plan = basic_config().plan().unwrap();
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.num_blocks(), 4);

        let first = &plan.stages[0];
        assert_eq!(first[0].channels, vec![3, 8, 8]);
        assert_eq!(first[0].stride, 1);
        assert_eq!(first[1].channels, vec![8, 8, 8]);

        let second = &plan.stages[1];
        assert_eq!(second[0].channels, vec![8, 16, 16]);
        assert_eq!(second[0].stride, 2);
        assert_eq!(second[1].channels, vec![16, 16, 16]);
        assert_eq!(second[1].stride, 1);
    }

    #[test]
    fn test_bottleneck_preset() {
        let config = ResNetConfig::bottleneck(&[(16, 8, 32, 2), (0, 16, 64, 1)]);
        assert_eq!(config.channels, vec![vec![16, 8, 8, 32], vec![32, 16, 16, 64]]);
        assert_eq!(config.kernels[0], vec![1, 3, 1]);
        let plan = config.plan().unwrap();
        assert_eq!(plan.stages[0][1].channels, vec![32, 8, 8, 32]);
    }

    #[test]
    fn test_plan_validation() {
        let mismatched = ResNetConfig::new(
            vec![vec![3, 8, 8]],
            vec![vec![3, 3], vec![3, 3]],
            vec![vec![1, 1]],
            vec![1],
        );
        assert!(matches!(mismatched.plan(), Err(Error::InvalidResNet(_))));

        let broken_chain = ResNetConfig::new(
            vec![vec![3, 8, 8], vec![4, 16, 16]],
            vec![vec![3, 3], vec![3, 3]],
            vec![vec![1, 1], vec![1, 1]],
            vec![1, 1],
        );
        assert!(matches!(broken_chain.plan(), Err(Error::InvalidResNet(_))));

        let mut no_blocks = basic_config();
        no_blocks.blocks = vec![1, 0];
        assert!(matches!(no_blocks.plan(), Err(Error::InvalidResNet(_))));

        let bad_set = ResNetConfig::new(vec![vec![3, 8]], vec![vec![3]], vec![vec![1]], vec![1]);
        assert!(matches!(bad_set.plan(), Err(Error::InvalidConvSet(_))));
    }

    #[test]
    fn test_resnet_2d_downsamples_per_stage() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Default::default();
        let resnet = basic_config().init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        let y = resnet.forward(x, None).unwrap();
        assert_eq!(y.dims(), [2, 16, 8, 8]);
    }

    #[test]
    fn test_resnet_1d_time_conditioned_with_attention() {
        let device = Default::default();
        let resnet = ResNetConfig::bottleneck(&[(2, 4, 8, 1), (0, 4, 8, 2), (0, 8, 16, 1)])
            .with_dims(1)
            .with_time_embed_dim(Some(8))
            .with_conv_attention(Some(AttentionConfig::new()))
            .with_residual(true)
            .with_out_layer(Some(ConvNdConfig::new([16, 3], 1).with_dims(1)))
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(resnet.is_time_conditioned());

        let x = Tensor::<TestBackend, 3>::ones([2, 2, 32], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device);
        let y = resnet.forward(x.clone(), Some(t)).unwrap();
        assert_eq!(y.dims(), [2, 3, 8]);

        assert_eq!(resnet.forward(x, None).unwrap_err(), Error::MissingTimeStep);
    }

    #[test]
    fn test_resnet_3d() {
        let device = Default::default();
        let resnet = ResNetConfig::new(
            vec![vec![1, 2, 2], vec![2, 4, 4]],
            vec![vec![3, 3], vec![3, 3]],
            vec![vec![1, 1], vec![1, 1]],
            vec![1, 1],
        )
        .with_dims(3)
        .init::<TestBackend>(&device)
        .unwrap();
        let x = Tensor::<TestBackend, 5>::zeros([1, 1, 4, 4, 4], &device);
        assert_eq!(resnet.forward(x, None).unwrap().dims(), [1, 4, 2, 2, 2]);
    }

    #[test]
    fn test_time_steps_must_match_batch() {
        let device = Default::default();
        let resnet = basic_config()
            .with_time_embed_dim(Some(8))
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 8, 8], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([4.0], &device);
        assert_eq!(
            resnet.forward(x, Some(t)).unwrap_err(),
            Error::BatchMismatch {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_gradients_flow_through_shortcuts() {
        let device = Default::default();
        let resnet = basic_config()
            .init::<TestAutodiffBackend>(&device)
            .unwrap();
        let x = Tensor::<TestAutodiffBackend, 4>::random(
            [2, 3, 8, 8],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let loss = resnet.forward(x, None).unwrap().mean();
        let grads = loss.backward();

        let shortcut = resnet.stages[1].blocks[0].residual.as_ref().unwrap();
        let conv = shortcut.conv.conv2d.as_ref().unwrap();
        assert!(conv.weight.grad(&grads).is_some());
    }
}
