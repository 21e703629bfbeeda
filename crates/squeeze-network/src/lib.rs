use burn::tensor::{backend::Backend, Data, Shape, Tensor};

pub mod fire;
pub mod model;
pub mod shape;
pub mod topology;

pub use model::{SqueezeNet, SqueezeNetConfig};
pub use shape::{FeatureShape, TopologyError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum InputLayoutError {
    #[error("a {shape} image holds {expected} values, got {actual}")]
    LengthMismatch {
        shape: FeatureShape,
        expected: usize,
        actual: usize,
    },
    #[error("a batch must contain at least one image")]
    EmptyBatch,
}

/// Converts one image stored height-major with interleaved channels into a channels-first
/// `[channels, height, width]` tensor.
pub fn channels_last_to_tensor<B: Backend>(
    pixels: &[f32],
    shape: FeatureShape,
) -> Result<Tensor<B, 3>, InputLayoutError> {
    let expected = shape.channels * shape.height * shape.width;

    if pixels.len() != expected {
        return Err(InputLayoutError::LengthMismatch {
            shape,
            expected,
            actual: pixels.len(),
        });
    }

    let data = Data::new(
        pixels.to_vec(),
        Shape::new([shape.height, shape.width, shape.channels]),
    );

    // [H, W, C] -> [C, W, H] -> [C, H, W]
    Ok(Tensor::from_data(data.convert())
        .swap_dims(0, 2)
        .swap_dims(1, 2))
}

/// Stacks channels-last images into a `[batch, channels, height, width]` network input.
pub fn images_to_batch<B: Backend>(
    images: &[&[f32]],
    shape: FeatureShape,
) -> Result<Tensor<B, 4>, InputLayoutError> {
    if images.is_empty() {
        return Err(InputLayoutError::EmptyBatch);
    }

    let images = images
        .iter()
        .map(|pixels| channels_last_to_tensor(pixels, shape))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Tensor::stack(images, 0))
}
