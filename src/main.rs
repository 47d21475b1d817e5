use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tiny_cnn::config::{DEFAULT_HIDDEN_SIZE, DEFAULT_L2};
use tiny_cnn::{Dataset, Image, Label, Network, NetworkConfig, TrainingConfig, Tunables};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tiny-cnn")]
#[command(about = "Train and run a tiny cat/dog convolutional classifier")]
struct Cli {
    /// Log hidden activations and other debug events
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Architecture {
    /// Input image width
    #[arg(long, default_value = "16")]
    width: usize,

    /// Input image height
    #[arg(long, default_value = "16")]
    height: usize,

    /// Number of convolution filters
    #[arg(long, default_value = "4")]
    filters: usize,

    /// Side length of each convolution kernel
    #[arg(long, default_value = "3")]
    kernel_size: usize,

    /// Side length of each max-pool window
    #[arg(long, default_value = "2")]
    pool_size: usize,

    /// Width of the hidden dense layer
    #[arg(long, default_value_t = DEFAULT_HIDDEN_SIZE)]
    hidden_size: usize,

    /// Weight initialization seed, taken from the clock when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// L2 regularization coefficient
    #[arg(long, default_value_t = DEFAULT_L2)]
    l2: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and save it
    Train {
        #[command(flatten)]
        arch: Architecture,

        /// Directory of PGM images, or a single image; synthetic data when omitted
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Number of training samples
        #[arg(long, default_value = "200")]
        samples: usize,

        /// Number of epochs
        #[arg(short, long, default_value = "10")]
        epochs: usize,

        /// Learning rate
        #[arg(long, default_value = "0.01")]
        learning_rate: f64,

        /// Stop after this many epochs without improvement
        #[arg(long)]
        patience: Option<usize>,

        /// Output model file
        #[arg(short, long, default_value = "model.bin")]
        output: PathBuf,
    },

    /// Classify images with a saved model
    Predict {
        #[command(flatten)]
        arch: Architecture,

        /// Model file
        #[arg(short, long, default_value = "model.bin")]
        model: PathBuf,

        /// PGM images to classify
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// Compare analytic and numeric gradients on a synthetic image
    Gradcheck {
        #[command(flatten)]
        arch: Architecture,

        /// Finite-difference step
        #[arg(long, default_value = "0.001")]
        epsilon: f64,

        /// Class of the synthetic image and its target
        #[arg(long, value_enum, default_value = "cat")]
        label: LabelArg,
    },

    /// Print the architecture and a sample of a saved model's parameters
    Summary {
        #[command(flatten)]
        arch: Architecture,

        /// Model file
        #[arg(short, long, default_value = "model.bin")]
        model: PathBuf,

        /// Number of kernel values to show
        #[arg(long, default_value = "8")]
        kernels: usize,

        /// Number of dense weights to show
        #[arg(long, default_value = "8")]
        dense: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LabelArg {
    Cat,
    Dog,
}

impl From<LabelArg> for Label {
    fn from(label: LabelArg) -> Label {
        match label {
            LabelArg::Cat => Label::Cat,
            LabelArg::Dog => Label::Dog,
        }
    }
}

impl Architecture {
    fn seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default()
        })
    }

    fn build(&self, seed: u64, debug: bool) -> Result<Network> {
        let config = NetworkConfig::new(
            self.width,
            self.height,
            self.filters,
            self.kernel_size,
            self.pool_size,
        )
        .with_hidden_size(self.hidden_size)
        .with_seed(seed)
        .with_tunables(Tunables { l2: self.l2, debug });
        Network::new(&config).context("Failed to create network")
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Train {
            arch,
            data_dir,
            samples,
            epochs,
            learning_rate,
            patience,
            output,
        } => {
            let seed = arch.seed();
            let mut network = arch.build(seed, cli.debug)?;
            let dataset = match &data_dir {
                Some(path) => Dataset::from_path(path, arch.width, arch.height, samples)
                    .with_context(|| {
                        format!("Failed to load training data from {}", path.display())
                    })?,
                None => Dataset::synthetic(arch.width, arch.height, samples),
            };
            info!(samples = dataset.len(), epochs, learning_rate, seed, "training");

            let config = TrainingConfig {
                epochs,
                learning_rate,
                patience,
                seed,
                ..TrainingConfig::default()
            };
            let report = network.train(&dataset, &config)?;
            if let Some(last) = report.last() {
                println!(
                    "Trained {} epochs: loss={:.4} acc={:.3}",
                    report.epochs.len(),
                    last.loss,
                    last.accuracy
                );
            }

            network
                .save(&output)
                .with_context(|| format!("Failed to save model to {}", output.display()))?;
            println!("Saved model to {}", output.display());
        }

        Commands::Predict { arch, model, images } => {
            let mut network = arch.build(arch.seed(), cli.debug)?;
            network
                .load(&model)
                .with_context(|| format!("Failed to load model from {}", model.display()))?;

            for path in &images {
                let image = Image::load(path, arch.width, arch.height)
                    .with_context(|| format!("Failed to load image {}", path.display()))?;
                let probability = network.forward(&image)?;
                let label = match Label::from_probability(probability) {
                    Label::Cat => "cat",
                    Label::Dog => "dog",
                };
                println!("{}: {label} (p={probability:.4})", path.display());
            }
        }

        Commands::Gradcheck { arch, epsilon, label } => {
            let mut network = arch.build(arch.seed(), cli.debug)?;
            let label = Label::from(label);
            let image = Image::synthetic(arch.width, arch.height, label);
            let report = network.grad_check(&image, label, epsilon)?;
            print!("{report}");
        }

        Commands::Summary {
            arch,
            model,
            kernels,
            dense,
        } => {
            let mut network = arch.build(arch.seed(), cli.debug)?;
            network
                .load(&model)
                .with_context(|| format!("Failed to load model from {}", model.display()))?;
            print!("{}", network.summary(kernels, dense));
        }
    }

    Ok(())
}
