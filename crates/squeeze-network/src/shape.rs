use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// The shape of a single feature map, without the batch dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl FeatureShape {
    pub const fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// The dimensions of a batch of feature maps with this shape, laid out as burn expects them.
    pub const fn batched(&self, batch_size: usize) -> [usize; 4] {
        [batch_size, self.channels, self.height, self.width]
    }

    pub const fn spatially_matches(&self, other: &Self) -> bool {
        self.height == other.height && self.width == other.width
    }
}

// Height by width by channels, as the literature writes it.
impl Display for FeatureShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum TopologyError {
    #[error("the network must classify into at least one class")]
    NoClasses,
    #[error("input must have a non-zero resolution and channel count, got {0}")]
    EmptyInput(FeatureShape),
    #[error("dropout probability must lie in [0, 1), got {0}")]
    InvalidDropout(f64),
    #[error("stage `{stage}` has a {kernel}x{kernel} window that does not fit its {input} input")]
    SpatialCollapse {
        stage: String,
        kernel: usize,
        input: FeatureShape,
    },
    #[error("stage `{stage}` cannot concatenate {left} with {right}, spatial dimensions differ")]
    MergeMismatch {
        stage: String,
        left: FeatureShape,
        right: FeatureShape,
    },
    #[error("stage `{stage}` slides its window with a stride of zero")]
    ZeroStride { stage: String },
    #[error("stage `{stage}` expects {expected} input channels, got {actual}")]
    ChannelMismatch {
        stage: String,
        expected: usize,
        actual: usize,
    },
}

fn sliding_window(size: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = size + 2 * padding;

    (padded >= kernel).then(|| (padded - kernel) / stride + 1)
}

fn sliding_window_2d(
    stage: &str,
    input: FeatureShape,
    channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<FeatureShape, TopologyError> {
    if stride == 0 {
        return Err(TopologyError::ZeroStride {
            stage: stage.to_owned(),
        });
    }

    let collapse = || TopologyError::SpatialCollapse {
        stage: stage.to_owned(),
        kernel,
        input,
    };

    Ok(FeatureShape {
        channels,
        height: sliding_window(input.height, kernel, stride, padding).ok_or_else(collapse)?,
        width: sliding_window(input.width, kernel, stride, padding).ok_or_else(collapse)?,
    })
}

/// The output shape of a square convolution. Output sizes are floored, so trailing rows and
/// columns the kernel cannot fully cover are dropped.
pub fn conv_output(
    stage: &str,
    input: FeatureShape,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<FeatureShape, TopologyError> {
    sliding_window_2d(stage, input, out_channels, kernel, stride, padding)
}

/// The output shape of an unpadded square max-pool. Channels pass through untouched.
pub fn pool_output(
    stage: &str,
    input: FeatureShape,
    kernel: usize,
    stride: usize,
) -> Result<FeatureShape, TopologyError> {
    sliding_window_2d(stage, input, input.channels, kernel, stride, 0)
}

/// Concatenates two feature maps along the channel axis.
pub fn concat_channels(
    stage: &str,
    left: FeatureShape,
    right: FeatureShape,
) -> Result<FeatureShape, TopologyError> {
    if !left.spatially_matches(&right) {
        return Err(TopologyError::MergeMismatch {
            stage: stage.to_owned(),
            left,
            right,
        });
    }

    Ok(FeatureShape {
        channels: left.channels + right.channels,
        ..left
    })
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(227, 7, 2, 0, 111; "conv1")]
    #[test_case(111, 3, 2, 0, 55; "maxpool1")]
    #[test_case(55, 3, 2, 0, 27; "maxpool4")]
    #[test_case(27, 3, 2, 0, 13; "maxpool8")]
    #[test_case(55, 3, 1, 1, 55; "padded expand")]
    #[test_case(55, 3, 1, 0, 53; "unpadded expand")]
    fn window_sizes(size: usize, kernel: usize, stride: usize, padding: usize, expected: usize) {
        let input = FeatureShape::new(8, size, size);

        assert_eq!(
            conv_output("window", input, 8, kernel, stride, padding).unwrap(),
            FeatureShape::new(8, expected, expected)
        );
    }

    #[test]
    fn pooling_keeps_channels() {
        let pooled = pool_output("pool", FeatureShape::new(96, 111, 111), 3, 2).unwrap();

        assert_eq!(pooled, FeatureShape::new(96, 55, 55));
    }

    #[test]
    fn oversized_kernel_collapses() {
        let error = pool_output("pool", FeatureShape::new(4, 2, 9), 3, 2).unwrap_err();

        assert!(matches!(error, TopologyError::SpatialCollapse { kernel: 3, .. }));
    }

    #[test]
    fn zero_stride_is_not_a_collapse() {
        let error = pool_output("pool", FeatureShape::new(4, 9, 9), 3, 0).unwrap_err();

        assert_eq!(
            error,
            TopologyError::ZeroStride {
                stage: "pool".to_owned()
            }
        );
    }

    #[test]
    fn concatenation_sums_channels() {
        let merged = concat_channels(
            "merge",
            FeatureShape::new(64, 55, 55),
            FeatureShape::new(32, 55, 55),
        )
        .unwrap();

        assert_eq!(merged, FeatureShape::new(96, 55, 55));
    }

    #[test]
    fn concatenation_rejects_spatial_mismatch() {
        let error = concat_channels(
            "merge",
            FeatureShape::new(64, 55, 55),
            FeatureShape::new(64, 53, 53),
        )
        .unwrap_err();

        assert_eq!(
            error.to_string(),
            "stage `merge` cannot concatenate 55x55x64 with 53x53x64, spatial dimensions differ"
        );
    }

    #[test]
    fn display_is_height_width_channels() {
        assert_eq!(FeatureShape::new(96, 111, 112).to_string(), "111x112x96");
    }
}
