mod progress;

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::optim::AdamWConfig;
use clap::{ArgAction, Parser};
use mvsep_core::checkpoint::{Checkpoint, LoadMode};
use mvsep_core::config::{
    DatasetConfig, InferenceConfig, ModelConfig, TrainingConfig, TransformConfig,
};
use mvsep_core::data::TrackDataset;
use mvsep_core::inference::ChunkedSeparator;
use mvsep_core::listener::DebugListener;
use mvsep_core::model::SeparationModel;
use mvsep_core::train::Trainer;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::progress::CliListener;

#[cfg(feature = "gpu")]
use burn::backend::wgpu::{graphics::AutoGraphicsApi, init_setup, RuntimeOptions};
#[cfg(feature = "gpu")]
use cubecl::config::{autotune::AutotuneConfig, cache::CacheConfig, GlobalConfig};

#[cfg(feature = "gpu")]
type B = burn::backend::wgpu::Wgpu;

#[cfg(not(feature = "gpu"))]
type B = burn::backend::NdArray<f32>;

type TrainBackend = burn::backend::Autodiff<B>;

#[derive(Parser)]
#[command(
    name = "mvsep",
    about = "Train a vocal separator or extract the instrumental from a stereo WAV file"
)]
struct Cli {
    /// Train the model
    #[arg(long, conflicts_with = "infer")]
    train: bool,

    /// Run inference on --input-wav
    #[arg(long)]
    infer: bool,

    /// Training data: one sub-directory per track
    #[arg(long, alias = "data_dir", default_value = "train")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 10000)]
    epochs: usize,

    #[arg(long, alias = "batch_size", default_value_t = 1)]
    batch_size: usize,

    #[arg(long, alias = "learning_rate", default_value_t = 1e-3)]
    learning_rate: f64,

    #[arg(long, alias = "weight_decay", default_value_t = 0.0)]
    weight_decay: f32,

    /// Save a checkpoint every N optimizer steps
    #[arg(long, alias = "checkpoint_steps", default_value_t = 100)]
    checkpoint_steps: usize,

    /// Checkpoint to resume training from, or to run inference with
    #[arg(long, alias = "checkpoint_path")]
    checkpoint_path: Option<PathBuf>,

    /// Where training checkpoints are written
    #[arg(long, alias = "checkpoint_dir", default_value = ".")]
    checkpoint_dir: PathBuf,

    #[arg(long, alias = "input_wav")]
    input_wav: Option<PathBuf>,

    #[arg(
        long,
        alias = "output_instrumental",
        default_value = "output_instrumental.wav"
    )]
    output_instrumental: PathBuf,

    /// Training segment length in samples
    #[arg(long, alias = "segment_length", default_value_t = 352800)]
    segment_length: usize,

    #[arg(long, alias = "num_layers", default_value_t = 8)]
    num_layers: usize,

    #[arg(long, alias = "hidden_size", default_value_t = 512)]
    hidden_size: usize,

    #[arg(long, alias = "n_fft", default_value_t = 4096)]
    n_fft: usize,

    #[arg(long, alias = "hop_length", default_value_t = 1024)]
    hop_length: usize,

    /// Sample rate every training track must share
    #[arg(long, alias = "sample_rate", default_value_t = 44100)]
    sample_rate: u32,

    /// Inference chunk length in samples
    #[arg(long, alias = "chunk_size", default_value_t = 16384)]
    chunk_size: usize,

    /// Samples shared by consecutive inference chunks
    #[arg(long, default_value_t = 4096)]
    overlap: usize,

    /// Also separate the samples after the last full chunk
    #[arg(long, alias = "pad_tail")]
    pad_tail: bool,

    /// Data loader threads
    #[arg(long, alias = "num_workers", default_value_t = 16)]
    num_workers: usize,

    /// Make training windows and track order reproducible
    #[arg(long)]
    seed: Option<u64>,

    /// Mixture file name inside each track directory
    #[arg(long, alias = "mixture_name", default_value = "other.wav")]
    mixture_name: String,

    /// Target (vocals) file name inside each track directory
    #[arg(long, alias = "target_name", default_value = "vocals.wav")]
    target_name: String,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log per-chunk and per-step statistics instead of drawing progress bars
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn transform_config(&self) -> TransformConfig {
        TransformConfig::new()
            .with_n_fft(self.n_fft)
            .with_hop_length(self.hop_length)
            .with_sample_rate(self.sample_rate)
    }

    fn model_config(&self) -> ModelConfig {
        ModelConfig::new()
            .with_num_layers(self.num_layers)
            .with_hidden_size(self.hidden_size)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if cli.train {
        run_train(&cli)
    } else if cli.infer {
        run_infer(&cli)
    } else {
        println!("Please specify either --train or --infer");
        Ok(())
    }
}

fn init_logging(cli: &Cli) {
    let filter = match (cli.verbose, cli.debug) {
        (0, false) => "warn",
        (0, true) | (1, _) => "info",
        (2, _) => "debug",
        _ => "trace",
    };
    let filter = if cli.debug && cli.verbose < 2 {
        format!("{filter},mvsep_core=debug")
    } else {
        filter.to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

fn init_device() -> burn::tensor::Device<B> {
    let device = Default::default();

    #[cfg(feature = "gpu")]
    {
        GlobalConfig::set(GlobalConfig {
            autotune: AutotuneConfig {
                cache: CacheConfig::Global,
                ..Default::default()
            },
            ..Default::default()
        });
        let options = RuntimeOptions {
            tasks_max: 128,
            ..Default::default()
        };
        init_setup::<AutoGraphicsApi>(&device, options);
    }

    device
}

fn run_train(cli: &Cli) -> Result<()> {
    let transform = cli.transform_config();
    transform.validate()?;
    let model_config = cli.model_config();

    let dataset_config = DatasetConfig::new(cli.data_dir.clone())
        .with_mixture_file(cli.mixture_name.clone())
        .with_target_file(cli.target_name.clone())
        .with_segment_length(cli.segment_length)
        .with_seed(cli.seed);
    dataset_config.validate(&transform)?;

    let training = TrainingConfig::new()
        .with_epochs(cli.epochs)
        .with_batch_size(cli.batch_size)
        .with_learning_rate(cli.learning_rate)
        .with_weight_decay(cli.weight_decay)
        .with_checkpoint_steps(cli.checkpoint_steps)
        .with_checkpoint_dir(cli.checkpoint_dir.clone())
        .with_resume_from(cli.checkpoint_path.clone())
        .with_num_workers(cli.num_workers);

    let dataset = TrackDataset::open(&dataset_config, &transform)
        .with_context(|| format!("Failed to open dataset {}", cli.data_dir.display()))?;
    eprintln!(
        "Training on {} tracks, {} frames per segment",
        dataset.len(),
        dataset.segment_frames()
    );

    let optimizer = AdamWConfig::new()
        .with_weight_decay(cli.weight_decay)
        .init::<TrainBackend, SeparationModel<TrainBackend>>();
    let trainer = Trainer::new(&model_config, &training, dataset, optimizer, init_device())
        .context("Failed to set up training")?;

    let (_, state) = if cli.debug {
        trainer.fit(&mut DebugListener)?
    } else {
        trainer.fit(&mut CliListener::default())?
    };

    eprintln!(
        "Trained {} steps, average loss {:.6}; loss log written to {}",
        state.step,
        state.avg_loss,
        training.loss_log_path.display()
    );
    Ok(())
}

fn run_infer(cli: &Cli) -> Result<()> {
    let Some(input) = &cli.input_wav else {
        println!("Please provide --input-wav for inference");
        return Ok(());
    };
    let Some(checkpoint_path) = &cli.checkpoint_path else {
        println!("Please provide --checkpoint-path for inference");
        return Ok(());
    };

    let transform = cli.transform_config();
    let inference = InferenceConfig::new()
        .with_chunk_size(cli.chunk_size)
        .with_overlap(cli.overlap)
        .with_pad_tail(cli.pad_tail);
    let model_config = cli.model_config();
    model_config.validate()?;

    eprintln!("Loading {}", checkpoint_path.display());
    let checkpoint = Checkpoint::load(checkpoint_path)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint_path.display()))?;
    if checkpoint.model_config != model_config {
        warn!(
            saved = ?checkpoint.model_config,
            "checkpoint was trained with a different model configuration"
        );
    }

    let model = model_config.init::<B>(&init_device());
    let (model, report) = checkpoint.apply(model, LoadMode::Lenient)?;
    if !report.is_exact() {
        eprintln!("Warning: {report}");
    }

    let separator = ChunkedSeparator::new(&model, &transform, &inference)?;
    eprintln!("Separating {}", input.display());
    let output = if cli.debug {
        separator.separate_file(input, &cli.output_instrumental, &mut DebugListener)?
    } else {
        separator.separate_file(input, &cli.output_instrumental, &mut CliListener::default())?
    };

    eprintln!(
        "Wrote {} ({} samples, {} Hz)",
        cli.output_instrumental.display(),
        output.len(),
        output.sample_rate()
    );
    Ok(())
}
