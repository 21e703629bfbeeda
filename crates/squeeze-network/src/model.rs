use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, ReLU,
    },
    tensor::{activation, backend::Backend, Tensor},
};
use tracing::instrument;

use crate::{
    fire::{ExpandPadding, Fire, FireConfig},
    shape::{self, FeatureShape, TopologyError},
    topology::{StageKind, Topology},
};

const CONV1_FILTERS: usize = 96;
const CONV1_KERNEL_LENGTH: usize = 7;
const CONV1_STRIDE: usize = 2;
const POOL_KERNEL_LENGTH: usize = 3;
const POOL_STRIDE: usize = 2;

struct FireStage {
    name: &'static str,
    squeeze: usize,
    expand_1x1: usize,
    expand_3x3: usize,
}

impl FireStage {
    const fn new(name: &'static str, squeeze: usize, expand_1x1: usize, expand_3x3: usize) -> Self {
        Self {
            name,
            squeeze,
            expand_1x1,
            expand_3x3,
        }
    }
}

const FIRE2: FireStage = FireStage::new("fire2", 16, 64, 64);
const FIRE3: FireStage = FireStage::new("fire3", 16, 64, 64);
const FIRE4: FireStage = FireStage::new("fire4", 32, 128, 128);
const FIRE5: FireStage = FireStage::new("fire5", 32, 128, 128);
const FIRE6: FireStage = FireStage::new("fire6", 48, 192, 192);
const FIRE7: FireStage = FireStage::new("fire7", 48, 192, 192);
const FIRE8: FireStage = FireStage::new("fire8", 64, 256, 256);
const FIRE9: FireStage = FireStage::new("fire9", 64, 256, 256);

fn trace_pool(
    topology: &mut Topology,
    name: &str,
    input: FeatureShape,
) -> Result<FeatureShape, TopologyError> {
    Ok(topology.push(
        name,
        StageKind::MaxPool {
            kernel: POOL_KERNEL_LENGTH,
            stride: POOL_STRIDE,
        },
        shape::pool_output(name, input, POOL_KERNEL_LENGTH, POOL_STRIDE)?,
    ))
}

/// Which fire module's output maxpool8 downsamples.
///
/// The reference layout pools fire7 and leaves fire8 dangling, which drops fire8 from the graph
/// entirely. [`Maxpool8Source::Fire8`] chains fire8 in as the paper describes.
#[derive(Config, Debug, PartialEq)]
pub enum Maxpool8Source {
    Fire7,
    Fire8,
}

#[derive(Module, Debug)]
pub struct SqueezeNet<B: Backend> {
    conv1: Conv2d<B>,
    maxpool1: MaxPool2d,
    fire2: Fire<B>,
    fire3: Fire<B>,
    fire4: Fire<B>,
    maxpool4: MaxPool2d,
    fire5: Fire<B>,
    fire6: Fire<B>,
    fire7: Fire<B>,
    fire8: Option<Fire<B>>,
    maxpool8: MaxPool2d,
    fire9: Fire<B>,
    dropout: Dropout,
    conv10: Conv2d<B>,
    avgpool10: AdaptiveAvgPool2d,
    activation: ReLU,
    num_classes: usize,
    input_channels: usize,
    input_height: usize,
    input_width: usize,
}

impl<B: Backend> SqueezeNet<B> {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn input_shape(&self) -> FeatureShape {
        FeatureShape::new(self.input_channels, self.input_height, self.input_width)
    }

    /// Per-class scores before normalization, of shape `[batch, num_classes]`.
    pub fn forward_scores(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.conv1.forward(input));
        let x = self.maxpool1.forward(x);

        let x = self.fire2.forward(x);
        let x = self.fire3.forward(x);
        let x = self.fire4.forward(x);
        let x = self.maxpool4.forward(x);

        let x = self.fire5.forward(x);
        let x = self.fire6.forward(x);
        let x = self.fire7.forward(x);
        let x = match &self.fire8 {
            Some(fire8) => fire8.forward(x),
            None => x,
        };
        let x = self.maxpool8.forward(x);

        let x = self.fire9.forward(x);
        let x = self.dropout.forward(x);
        let x = self.activation.forward(self.conv10.forward(x));
        let x = self.avgpool10.forward(x);

        x.flatten::<2>(1, 3)
    }

    /// Class probabilities of shape `[batch, num_classes]`, each row summing to one.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        activation::softmax(self.forward_scores(input), 1)
    }
}

#[derive(Config, Debug)]
pub struct SqueezeNetConfig {
    pub num_classes: usize,
    // 227 rather than the 224 usually cited, so conv1 produces 111x111x96.
    #[config(default = 227)]
    pub input_height: usize,
    #[config(default = 227)]
    pub input_width: usize,
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
    #[config(default = "ExpandPadding::Same")]
    pub expand_padding: ExpandPadding,
    #[config(default = "Maxpool8Source::Fire7")]
    pub maxpool8_source: Maxpool8Source,
}

impl SqueezeNetConfig {
    pub fn input_shape(&self) -> FeatureShape {
        FeatureShape::new(self.input_channels, self.input_height, self.input_width)
    }

    fn fire_config(&self, stage: &FireStage, in_channels: usize) -> FireConfig {
        FireConfig::new(
            in_channels,
            stage.squeeze,
            stage.expand_1x1,
            stage.expand_3x3,
        )
        .with_expand_padding(self.expand_padding.clone())
    }

    fn trace_fire(
        &self,
        topology: &mut Topology,
        stage: &FireStage,
        input: FeatureShape,
    ) -> Result<FeatureShape, TopologyError> {
        self.fire_config(stage, input.channels)
            .trace(stage.name, input, topology)
    }

    fn validate(&self) -> Result<(), TopologyError> {
        let input = self.input_shape();

        if self.num_classes == 0 {
            Err(TopologyError::NoClasses)
        } else if input.channels == 0 || input.height == 0 || input.width == 0 {
            Err(TopologyError::EmptyInput(input))
        } else if !(0.0..1.0).contains(&self.dropout) {
            Err(TopologyError::InvalidDropout(self.dropout))
        } else {
            Ok(())
        }
    }

    /// Traces every stage of the network from the configured input to the class probabilities,
    /// failing on the first stage whose shape is inconsistent.
    pub fn trace(&self) -> Result<Topology, TopologyError> {
        self.validate()?;

        let mut topology = Topology::new();

        let input = topology.push("input", StageKind::Input, self.input_shape());
        let x = topology.push(
            "conv1",
            StageKind::Convolution {
                kernel: CONV1_KERNEL_LENGTH,
                stride: CONV1_STRIDE,
                padding: 0,
            },
            shape::conv_output(
                "conv1",
                input,
                CONV1_FILTERS,
                CONV1_KERNEL_LENGTH,
                CONV1_STRIDE,
                0,
            )?,
        );
        let x = trace_pool(&mut topology, "maxpool1", x)?;

        let x = self.trace_fire(&mut topology, &FIRE2, x)?;
        let x = self.trace_fire(&mut topology, &FIRE3, x)?;
        let x = self.trace_fire(&mut topology, &FIRE4, x)?;
        let x = trace_pool(&mut topology, "maxpool4", x)?;

        let x = self.trace_fire(&mut topology, &FIRE5, x)?;
        let x = self.trace_fire(&mut topology, &FIRE6, x)?;
        let x = self.trace_fire(&mut topology, &FIRE7, x)?;
        let x = match self.maxpool8_source {
            Maxpool8Source::Fire7 => x,
            Maxpool8Source::Fire8 => self.trace_fire(&mut topology, &FIRE8, x)?,
        };
        let x = trace_pool(&mut topology, "maxpool8", x)?;

        let x = self.trace_fire(&mut topology, &FIRE9, x)?;
        let x = topology.push(
            "fire9_dropout",
            StageKind::Dropout {
                probability: self.dropout,
            },
            x,
        );
        let x = topology.push(
            "conv10",
            StageKind::Convolution {
                kernel: 1,
                stride: 1,
                padding: 0,
            },
            shape::conv_output("conv10", x, self.num_classes, 1, 1, 0)?,
        );
        let x = topology.push(
            "avgpool10",
            StageKind::GlobalAveragePool,
            FeatureShape::new(x.channels, 1, 1),
        );
        topology.push("softmax", StageKind::Softmax, x);

        for stage in topology.stages() {
            tracing::debug!(
                stage = %stage.name,
                kind = %stage.kind,
                output = %stage.output,
                "traced stage"
            );
        }

        Ok(topology)
    }

    /// Builds the network, after checking the whole topology is shape-consistent.
    #[instrument(name = "init squeezenet", skip_all, fields(num_classes = self.num_classes))]
    pub fn init<B: Backend>(&self) -> Result<SqueezeNet<B>, TopologyError> {
        let topology = self.trace()?;

        let pool = || {
            MaxPool2dConfig::new([POOL_KERNEL_LENGTH, POOL_KERNEL_LENGTH])
                .with_strides([POOL_STRIDE, POOL_STRIDE])
                .init()
        };

        let fire2 = self.fire_config(&FIRE2, CONV1_FILTERS);
        let fire3 = self.fire_config(&FIRE3, fire2.out_channels());
        let fire4 = self.fire_config(&FIRE4, fire3.out_channels());
        let fire5 = self.fire_config(&FIRE5, fire4.out_channels());
        let fire6 = self.fire_config(&FIRE6, fire5.out_channels());
        let fire7 = self.fire_config(&FIRE7, fire6.out_channels());
        let fire8 = match self.maxpool8_source {
            Maxpool8Source::Fire7 => None,
            Maxpool8Source::Fire8 => Some(self.fire_config(&FIRE8, fire7.out_channels())),
        };
        let fire9 = self.fire_config(
            &FIRE9,
            fire8
                .as_ref()
                .map_or(fire7.out_channels(), FireConfig::out_channels),
        );

        let network = SqueezeNet {
            conv1: Conv2dConfig::new(
                [self.input_channels, CONV1_FILTERS],
                [CONV1_KERNEL_LENGTH, CONV1_KERNEL_LENGTH],
            )
            .with_stride([CONV1_STRIDE, CONV1_STRIDE])
            .init(),
            maxpool1: pool(),
            fire2: fire2.init()?,
            fire3: fire3.init()?,
            fire4: fire4.init()?,
            maxpool4: pool(),
            fire5: fire5.init()?,
            fire6: fire6.init()?,
            fire7: fire7.init()?,
            fire8: fire8.map(|fire8| fire8.init()).transpose()?,
            maxpool8: pool(),
            conv10: Conv2dConfig::new([fire9.out_channels(), self.num_classes], [1, 1]).init(),
            fire9: fire9.init()?,
            dropout: DropoutConfig::new(self.dropout).init(),
            avgpool10: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: ReLU::default(),
            num_classes: self.num_classes,
            input_channels: self.input_channels,
            input_height: self.input_height,
            input_width: self.input_width,
        };

        tracing::info!(
            stages = topology.stages().len(),
            parameters = network.num_params(),
            "initialized network"
        );

        Ok(network)
    }
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::{Autodiff, NdArray},
        module::AutodiffModule,
        tensor::Tensor,
    };
    use test_case::test_case;

    use super::*;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    // Large enough to survive every pooling stage: 64 -> 29 -> 14 -> 6 -> 2.
    fn small_config(num_classes: usize) -> SqueezeNetConfig {
        SqueezeNetConfig::new(num_classes)
            .with_input_height(64)
            .with_input_width(64)
    }

    fn row_sums(probabilities: Tensor<impl Backend, 2>) -> Vec<f32> {
        probabilities.sum_dim(1).into_data().convert::<f32>().value
    }

    fn stage_output(topology: &Topology, name: &str) -> FeatureShape {
        topology
            .stage(name)
            .unwrap_or_else(|| panic!("missing stage {name}"))
            .output
    }

    #[test]
    fn reference_shapes() {
        let topology = SqueezeNetConfig::new(1000).trace().unwrap();

        assert_eq!(stage_output(&topology, "input").to_string(), "227x227x3");
        assert_eq!(stage_output(&topology, "conv1").to_string(), "111x111x96");
        assert_eq!(stage_output(&topology, "maxpool1").to_string(), "55x55x96");
        assert_eq!(
            stage_output(&topology, "fire4_expand_merge").to_string(),
            "55x55x256"
        );
        assert_eq!(stage_output(&topology, "maxpool4").to_string(), "27x27x256");
        assert_eq!(
            stage_output(&topology, "fire7_expand_merge").to_string(),
            "27x27x384"
        );
        assert_eq!(stage_output(&topology, "maxpool8").to_string(), "13x13x384");
        assert_eq!(
            stage_output(&topology, "fire9_expand_merge").to_string(),
            "13x13x512"
        );
        assert_eq!(stage_output(&topology, "conv10").to_string(), "13x13x1000");
        assert_eq!(stage_output(&topology, "avgpool10").to_string(), "1x1x1000");
        assert_eq!(topology.output(), Some(FeatureShape::new(1000, 1, 1)));
    }

    #[test]
    fn default_graph_skips_fire8() {
        let topology = SqueezeNetConfig::new(10).trace().unwrap();

        assert!(topology
            .stages()
            .iter()
            .all(|stage| !stage.name.starts_with("fire8")));

        let network = SqueezeNetConfig::new(1000).init::<TestBackend>().unwrap();

        assert!(network.fire8.is_none());
        assert_eq!(network.num_params(), 1_051_240);
    }

    #[test]
    fn fire8_source_widens_fire9() {
        let config = SqueezeNetConfig::new(1000).with_maxpool8_source(Maxpool8Source::Fire8);
        let topology = config.trace().unwrap();

        assert_eq!(
            stage_output(&topology, "fire8_expand_merge").to_string(),
            "27x27x512"
        );
        assert_eq!(stage_output(&topology, "maxpool8").to_string(), "13x13x512");

        let network = config.init::<TestBackend>().unwrap();

        assert!(network.fire8.is_some());
        assert_eq!(network.num_params(), 1_248_424);
    }

    #[test]
    fn unpadded_expand_is_rejected_before_allocation() {
        let error = SqueezeNetConfig::new(10)
            .with_expand_padding(ExpandPadding::Valid)
            .init::<TestBackend>()
            .unwrap_err();

        assert!(matches!(
            error,
            TopologyError::MergeMismatch { ref stage, .. } if stage == "fire2_expand_merge"
        ));
    }

    #[test_case(SqueezeNetConfig::new(0) => matches TopologyError::NoClasses; "no classes")]
    #[test_case(SqueezeNetConfig::new(10).with_input_channels(0) => matches TopologyError::EmptyInput(_); "no channels")]
    #[test_case(SqueezeNetConfig::new(10).with_dropout(1.0) => matches TopologyError::InvalidDropout(_); "dropout drops everything")]
    #[test_case(SqueezeNetConfig::new(10).with_dropout(-0.1) => matches TopologyError::InvalidDropout(_); "negative dropout")]
    #[test_case(
        SqueezeNetConfig::new(10).with_input_height(31).with_input_width(31)
            => matches TopologyError::SpatialCollapse { .. };
        "input too small to pool"
    )]
    fn invalid_configurations(config: SqueezeNetConfig) -> TopologyError {
        config.trace().unwrap_err()
    }

    #[test]
    fn conv1_matches_reference_shape() {
        let network = SqueezeNetConfig::new(10).init::<TestBackend>().unwrap();

        let output = network.conv1.forward(Tensor::zeros([1, 3, 227, 227]));

        assert_eq!(output.dims(), [1, 96, 111, 111]);
    }

    #[test_case(1; "single class")]
    #[test_case(10; "ten classes")]
    #[test_case(37; "odd class count")]
    fn outputs_are_distributions(num_classes: usize) {
        let network = small_config(num_classes).init::<TestBackend>().unwrap();

        let probabilities = network.forward(Tensor::ones([3, 3, 64, 64]));

        assert_eq!(probabilities.dims(), [3, num_classes]);
        assert!(row_sums(probabilities)
            .iter()
            .all(|sum| (sum - 1.0).abs() < 1e-4));
    }

    #[test]
    fn zero_batch_end_to_end() {
        let network = SqueezeNetConfig::new(1000).init::<TestBackend>().unwrap();

        let probabilities = network.forward(Tensor::zeros([2, 3, 227, 227]));

        assert_eq!(probabilities.dims(), [2, 1000]);
        assert!(row_sums(probabilities)
            .iter()
            .all(|sum| (sum - 1.0).abs() < 1e-4));
    }

    #[test]
    fn dropout_is_identity_in_inference() {
        let network = small_config(4).init::<TestBackend>().unwrap();
        let input = Tensor::<TestBackend, 4>::ones([16, 512, 2, 2]);

        let output = network.dropout.forward(input.clone());

        assert_eq!(output.into_data(), input.into_data());
    }

    #[test]
    fn dropout_halves_activations_in_training() {
        let network = small_config(4).init::<TestAutodiffBackend>().unwrap();

        let output = network
            .dropout
            .forward(Tensor::<TestAutodiffBackend, 4>::ones([16, 512, 2, 2]));
        let values = output.into_data().convert::<f32>().value;

        let dropped = values.iter().filter(|value| **value == 0.0).count();
        let retention = 1.0 - dropped as f32 / values.len() as f32;

        assert!((0.45..0.55).contains(&retention), "retention was {retention}");
        // Kept activations are rescaled so the expected sum is unchanged.
        assert!(values
            .iter()
            .all(|value| *value == 0.0 || (value - 2.0).abs() < 1e-6));
    }

    #[test]
    fn inference_copy_is_deterministic() {
        let network = small_config(5)
            .init::<TestAutodiffBackend>()
            .unwrap()
            .valid();
        let input = Tensor::<TestBackend, 4>::ones([2, 3, 64, 64]);

        let first = network.forward(input.clone()).into_data();
        let second = network.forward(input).into_data();

        assert_eq!(first, second);
    }

    #[test]
    fn training_forwards_apply_dropout() {
        let network = small_config(10).init::<TestAutodiffBackend>().unwrap();
        let input = Tensor::<TestAutodiffBackend, 4>::ones([2, 3, 64, 64]);

        let first = network.forward_scores(input.clone()).into_data();
        let second = network.forward_scores(input.clone()).into_data();

        assert_ne!(first, second);

        let network = network.valid();
        let input = input.inner();

        assert_eq!(
            network.forward_scores(input.clone()).into_data(),
            network.forward_scores(input).into_data()
        );
    }

    #[test]
    fn training_forwards_match_without_dropout() {
        let network = small_config(10)
            .with_dropout(0.0)
            .init::<TestAutodiffBackend>()
            .unwrap();
        let input = Tensor::<TestAutodiffBackend, 4>::ones([2, 3, 64, 64]);

        assert_eq!(
            network.forward_scores(input.clone()).into_data(),
            network.forward_scores(input).into_data()
        );
    }

    #[test]
    fn gradients_reach_conv1() {
        let network = small_config(3).init::<TestAutodiffBackend>().unwrap();

        let probabilities = network.forward(Tensor::ones([2, 3, 64, 64]));
        let loss = probabilities.slice([0..2, 0..1]).sum();
        let gradients = loss.backward();

        let conv1_gradient = network.conv1.clone().into_record().weight.grad(&gradients).unwrap();

        assert_eq!(conv1_gradient.dims(), [96, 3, 7, 7]);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = SqueezeNetConfig::new(21).with_maxpool8_source(Maxpool8Source::Fire8);

        let decoded = SqueezeNetConfig::load_binary(&config.to_string().into_bytes()).unwrap();

        assert_eq!(decoded.num_classes, 21);
        assert_eq!(decoded.maxpool8_source, Maxpool8Source::Fire8);
        assert_eq!(decoded.input_shape(), FeatureShape::new(3, 227, 227));
    }
}
