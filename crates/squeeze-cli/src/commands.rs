use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
};

use burn::{
    config::Config,
    tensor::{backend::Backend, Tensor},
};
use burn_wgpu::Wgpu;
use squeeze_network::{fire::ExpandPadding, model::Maxpool8Source, SqueezeNetConfig};
use tracing::instrument;

const DEFAULT_CLASSES: usize = 1000;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CliError {
    #[error("could not load network configuration from {path}")]
    LoadConfig {
        path: PathBuf,
        #[source]
        source: burn::config::ConfigError,
    },
    #[error("could not write network configuration to {path}")]
    SaveConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("batch must contain at least one image")]
    EmptyBatch,
}

/// Command line adjustments applied on top of a default or loaded configuration.
#[derive(Debug, Default)]
pub struct NetworkOverrides {
    pub config_file: Option<PathBuf>,
    pub num_classes: Option<usize>,
    pub maxpool8_source: Option<Maxpool8Source>,
    pub expand_padding: Option<ExpandPadding>,
}

impl NetworkOverrides {
    pub fn resolve(self) -> Result<SqueezeNetConfig, CliError> {
        let mut config = match self.config_file {
            Some(path) => SqueezeNetConfig::load(&path)
                .map_err(|source| CliError::LoadConfig { path, source })?,
            None => SqueezeNetConfig::new(DEFAULT_CLASSES),
        };

        if let Some(num_classes) = self.num_classes {
            config.num_classes = num_classes;
        }

        if let Some(maxpool8_source) = self.maxpool8_source {
            config.maxpool8_source = maxpool8_source;
        }

        if let Some(expand_padding) = self.expand_padding {
            config.expand_padding = expand_padding;
        }

        Ok(config)
    }
}

pub fn trace(overrides: NetworkOverrides) -> Result<(), Box<dyn Error>> {
    let config = overrides.resolve()?;
    let topology = config.trace()?;

    tracing::info!(stages = topology.stages().len(), "traced topology");
    print!("{topology}");

    Ok(())
}

pub fn write_config(overrides: NetworkOverrides, output: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = overrides.resolve()?;

    // Refuse to persist a configuration that cannot be built.
    config.trace()?;
    config
        .save(&output)
        .map_err(|source| CliError::SaveConfig {
            path: output.clone(),
            source,
        })?;

    tracing::info!(path = %output.display(), "wrote configuration");

    Ok(())
}

#[instrument(name = "forward", skip(overrides))]
pub fn forward(overrides: NetworkOverrides, batch: usize) -> Result<(), Box<dyn Error>> {
    let config = overrides.resolve()?;

    forward_on::<Wgpu>(&config, batch, &mut io::stdout().lock())
}

fn forward_on<B: Backend>(
    config: &SqueezeNetConfig,
    batch: usize,
    output: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    if batch == 0 {
        return Err(CliError::EmptyBatch.into());
    }

    let network = config.init::<B>()?;
    tracing::info!("initialized network");

    let input = Tensor::<B, 4>::zeros(network.input_shape().batched(batch));
    let probabilities = network.forward(input);
    let dims = probabilities.dims();

    tracing::info!(?dims, "ran forward pass");

    let sums = probabilities
        .sum_dim(1)
        .into_data()
        .convert::<f32>()
        .value;

    writeln!(output, "output shape: {dims:?}")?;

    for (index, sum) in sums.iter().enumerate() {
        writeln!(output, "image {index}: probabilities sum to {sum:.6}")?;
    }

    Ok(())
}
