mod commands;

use std::{error::Error, fs::File, path::PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use commands::NetworkOverrides;
use squeeze_network::{fire::ExpandPadding, model::Maxpool8Source};
use tracing::Level;

#[derive(Parser)]
#[command(version = "0.1.0")]
#[command(about = "Inspect and smoke-test the SqueezeNet topology")]
struct Cli {
    #[arg(
        short,
        long,
        help = "Activate tracing and write results to the specified file after truncating or creating it"
    )]
    trace_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Print the shape produced by every stage of the network")]
    Trace {
        #[command(flatten)]
        network: NetworkArgs,
    },
    #[command(about = "Write the network configuration as JSON")]
    Config {
        #[command(flatten)]
        network: NetworkArgs,
        #[arg(short, long, help = "File to write the configuration to")]
        output: PathBuf,
    },
    #[command(about = "Run a batch of blank images through the network on the GPU")]
    Forward {
        #[command(flatten)]
        network: NetworkArgs,
        #[arg(short, long, default_value_t = 1, help = "Number of images in the batch")]
        batch: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PoolSourceArg {
    Fire7,
    Fire8,
}

impl From<PoolSourceArg> for Maxpool8Source {
    fn from(source: PoolSourceArg) -> Self {
        match source {
            PoolSourceArg::Fire7 => Self::Fire7,
            PoolSourceArg::Fire8 => Self::Fire8,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PaddingArg {
    Same,
    Valid,
}

impl From<PaddingArg> for ExpandPadding {
    fn from(padding: PaddingArg) -> Self {
        match padding {
            PaddingArg::Same => Self::Same,
            PaddingArg::Valid => Self::Valid,
        }
    }
}

#[derive(Args)]
struct NetworkArgs {
    #[arg(short, long, help = "Load the network configuration from a JSON file")]
    config: Option<PathBuf>,
    #[arg(long, help = "Number of classes to predict [default: 1000]")]
    classes: Option<usize>,
    #[arg(long, value_enum, help = "Fire module whose output feeds maxpool8")]
    maxpool8_source: Option<PoolSourceArg>,
    #[arg(long, value_enum, help = "Padding of the 3x3 expand convolutions")]
    expand_padding: Option<PaddingArg>,
}

impl From<NetworkArgs> for NetworkOverrides {
    fn from(args: NetworkArgs) -> Self {
        Self {
            config_file: args.config,
            num_classes: args.classes,
            maxpool8_source: args.maxpool8_source.map(Into::into),
            expand_padding: args.expand_padding.map(Into::into),
        }
    }
}

fn initialize_tracing(trace_file: PathBuf) -> Result<(), Box<dyn Error>> {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(File::create(trace_file)?)
        .event_format(tracing_subscriber::fmt::format().without_time().json())
        .with_thread_ids(true)
        .with_max_level(Level::TRACE)
        .finish();

    Ok(tracing::subscriber::set_global_default(subscriber)?)
}

pub fn cli() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if let Some(trace_file) = cli.trace_file {
        initialize_tracing(trace_file)?;
    }

    match cli.command {
        Command::Trace { network } => commands::trace(network.into()),
        Command::Config { network, output } => commands::write_config(network.into(), output),
        Command::Forward { network, batch } => commands::forward(network.into(), batch),
    }
}
