/// CycleGAN command line: train on an image folder pair, or translate test images
use std::path::PathBuf;

use anyhow::Context;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};

use cyclegan::data::{BatchStream, ImageStream, Mode};
use cyclegan::models::loader::load_final_models;
use cyclegan::training::{translate, FanoutSink, FileSink, LogSink, MetricsSink, Trainer};
use cyclegan::CycleGanConfig;

#[derive(Parser)]
#[command(name = "cyclegan", version, about = "Unpaired image-to-image translation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train all four networks, resuming from the newest checkpoint
    Train(TrainArgs),
    /// Translate test-X images with the final GeneratorG
    Generate(GenerateArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// JSON configuration file; missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding trainA/trainB/testA/testB
    #[arg(long)]
    image_root: Option<PathBuf>,

    /// Run on the CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,
}

#[derive(Args)]
struct TrainArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Start fresh instead of failing on an unreadable checkpoint
    #[arg(long)]
    fresh_start_on_corrupt: bool,

    /// Skip translating test images after training
    #[arg(long)]
    skip_eval: bool,
}

#[derive(Args)]
struct GenerateArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of test batches to translate
    #[arg(long)]
    limit: Option<usize>,
}

fn load_config(common: &CommonArgs) -> anyhow::Result<CycleGanConfig> {
    let mut config = match &common.config {
        Some(path) => CycleGanConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => CycleGanConfig::default(),
    };
    if let Some(root) = &common.image_root {
        config.data.image_root = root.clone();
    }
    Ok(config)
}

fn select_device(cpu: bool) -> anyhow::Result<Device> {
    let device = if !cpu && candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);
    Ok(device)
}

fn train(args: TrainArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.common)?;
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(dir) = args.checkpoint_dir {
        config.paths.checkpoint_dir = dir;
    }
    if args.fresh_start_on_corrupt {
        config.training.fresh_start_on_corrupt = true;
    }
    config.validate()?;
    log::info!("Configuration: {:#?}", config);

    let device = select_device(args.common.cpu)?;
    let data = &config.data;
    let size = config.model.image_size;

    let mut train_x = ImageStream::open(&data.train_x_path(), Mode::Train, data, size, data.seed)
        .context("opening train-X images")?;
    let mut train_y = ImageStream::open(
        &data.train_y_path(),
        Mode::Train,
        data,
        size,
        data.seed.wrapping_add(1),
    )
    .context("opening train-Y images")?;
    let mut test_x = ImageStream::open(&data.test_x_path(), Mode::Test, data, size, data.seed)
        .context("opening test-X images")?;
    log::info!(
        "Batches per epoch: {} x {}",
        train_x.num_batches(),
        train_y.num_batches()
    );

    let sinks: Vec<Box<dyn MetricsSink>> = vec![
        Box::new(LogSink::new(config.training.log_every)),
        Box::new(FileSink::new(&config.paths.log_dir, &config.paths.image_dir)?),
    ];
    let mut trainer = Trainer::new(&config, &device, FanoutSink::new(sinks))?;
    if let Some(sample) = test_x.next_batch(&device)? {
        trainer = trainer.with_preview_sample(sample);
    }

    trainer.run(&mut train_x, &mut train_y)?;

    if !args.skip_eval {
        trainer.evaluate(&mut test_x, config.training.eval_samples)?;
    }
    Ok(())
}

fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let config = load_config(&args.common)?;
    let device = select_device(args.common.cpu)?;

    let models = load_final_models(&config.paths.model_dir, &device).with_context(|| {
        format!("loading final models from {}", config.paths.model_dir.display())
    })?;
    let size = models.config().image_size;
    let mut test_x = ImageStream::open(
        &config.data.test_x_path(),
        Mode::Test,
        &config.data,
        size,
        config.data.seed,
    )
    .context("opening test-X images")?;

    let mut sink = FileSink::new(&config.paths.log_dir, &config.paths.image_dir)?;
    let limit = args.limit.unwrap_or(config.training.eval_samples);
    let count = translate(&models, &mut test_x, limit, &mut sink)?;
    log::info!(
        "Wrote {} images to {}",
        count,
        config.paths.image_dir.display()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Train(args) => train(args),
        Command::Generate(args) => generate(args),
    }
}
