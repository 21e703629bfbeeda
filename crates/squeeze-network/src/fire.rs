use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d, ReLU,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::{
    shape::{self, FeatureShape, TopologyError},
    topology::{StageKind, Topology},
};

const EXPAND_KERNEL_LENGTH: usize = 3;

/// How the 3x3 expand convolution pads its input.
///
/// Only [`ExpandPadding::Same`] produces a map the 1x1 branch can be concatenated with; `Valid`
/// exists so the choice is spelled out, and is rejected when tracing.
#[derive(Config, Debug, PartialEq)]
pub enum ExpandPadding {
    Same,
    Valid,
}

impl ExpandPadding {
    fn amount(&self, kernel_length: usize) -> usize {
        match self {
            Self::Same => kernel_length / 2,
            Self::Valid => 0,
        }
    }

    fn to_padding_config(&self) -> PaddingConfig2d {
        match self {
            Self::Same => PaddingConfig2d::Same,
            Self::Valid => PaddingConfig2d::Valid,
        }
    }
}

/// A squeeze layer followed by two parallel expand layers, concatenated along channels.
#[derive(Module, Debug)]
pub struct Fire<B: Backend> {
    squeeze: Conv2d<B>,
    expand_1x1: Conv2d<B>,
    expand_3x3: Conv2d<B>,
    activation: ReLU,
}

impl<B: Backend> Fire<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let squeezed = self.activation.forward(self.squeeze.forward(input));

        // Both expand branches read the squeezed map directly.
        let expanded_1x1 = self
            .activation
            .forward(self.expand_1x1.forward(squeezed.clone()));
        let expanded_3x3 = self.activation.forward(self.expand_3x3.forward(squeezed));

        Tensor::cat(vec![expanded_1x1, expanded_3x3], 1)
    }
}

#[derive(Config, Debug)]
pub struct FireConfig {
    pub in_channels: usize,
    pub squeeze: usize,
    pub expand_1x1: usize,
    pub expand_3x3: usize,
    #[config(default = "ExpandPadding::Same")]
    pub expand_padding: ExpandPadding,
}

impl FireConfig {
    pub fn out_channels(&self) -> usize {
        self.expand_1x1 + self.expand_3x3
    }

    /// Traces the four sub-layers of a fire stage called `name` into `topology`, checking that
    /// both expand branches agree spatially before they are merged.
    pub fn trace(
        &self,
        name: &str,
        input: FeatureShape,
        topology: &mut Topology,
    ) -> Result<FeatureShape, TopologyError> {
        if input.channels != self.in_channels {
            return Err(TopologyError::ChannelMismatch {
                stage: name.to_owned(),
                expected: self.in_channels,
                actual: input.channels,
            });
        }

        let pointwise = StageKind::Convolution {
            kernel: 1,
            stride: 1,
            padding: 0,
        };
        let expand_padding = self.expand_padding.amount(EXPAND_KERNEL_LENGTH);

        let squeeze_name = format!("{name}_squeeze");
        let squeezed = topology.push(
            &squeeze_name,
            pointwise.clone(),
            shape::conv_output(&squeeze_name, input, self.squeeze, 1, 1, 0)?,
        );

        let expand_1x1_name = format!("{name}_expand_1x1");
        let expanded_1x1 = topology.push(
            &expand_1x1_name,
            pointwise,
            shape::conv_output(&expand_1x1_name, squeezed, self.expand_1x1, 1, 1, 0)?,
        );

        let expand_3x3_name = format!("{name}_expand_3x3");
        let expanded_3x3 = topology.push(
            &expand_3x3_name,
            StageKind::Convolution {
                kernel: EXPAND_KERNEL_LENGTH,
                stride: 1,
                padding: expand_padding,
            },
            shape::conv_output(
                &expand_3x3_name,
                squeezed,
                self.expand_3x3,
                EXPAND_KERNEL_LENGTH,
                1,
                expand_padding,
            )?,
        );

        let merge_name = format!("{name}_expand_merge");

        Ok(topology.push(
            &merge_name,
            StageKind::Concat,
            shape::concat_channels(&merge_name, expanded_1x1, expanded_3x3)?,
        ))
    }

    /// Builds the module, refusing configurations whose expand branches cannot be merged.
    pub fn init<B: Backend>(&self) -> Result<Fire<B>, TopologyError> {
        // The smallest map the 3x3 kernel fits; any padding that breaks the merge breaks it here.
        let nominal_input = FeatureShape::new(
            self.in_channels,
            EXPAND_KERNEL_LENGTH,
            EXPAND_KERNEL_LENGTH,
        );
        self.trace("fire", nominal_input, &mut Topology::new())?;

        Ok(Fire {
            squeeze: Conv2dConfig::new([self.in_channels, self.squeeze], [1, 1]).init(),
            expand_1x1: Conv2dConfig::new([self.squeeze, self.expand_1x1], [1, 1]).init(),
            expand_3x3: Conv2dConfig::new(
                [self.squeeze, self.expand_3x3],
                [EXPAND_KERNEL_LENGTH, EXPAND_KERNEL_LENGTH],
            )
            .with_padding(self.expand_padding.to_padding_config())
            .init(),
            activation: ReLU::default(),
        })
    }
}
