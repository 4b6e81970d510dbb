//! CLI entry point for CIFAR-10 ResNet training.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cifar_resnet_rs::{CifarData, Result, TrainConfig, Trainer};

#[derive(Parser)]
#[command(name = "cifar-resnet")]
#[command(about = "Train a ResNet-18 on CIFAR-10")]
#[command(version)]
struct Cli {
    /// Directory to store CIFAR-10 data
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Batch size
    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Number of epochs
    #[arg(long, default_value_t = 120)]
    epochs: usize,

    /// Initial learning rate
    #[arg(long, default_value_t = 0.1)]
    lr: f64,

    /// Momentum for the SGD optimizer
    #[arg(long, default_value_t = 0.9)]
    momentum: f64,

    /// Weight decay for the optimizer
    #[arg(long, default_value_t = 5e-4)]
    weight_decay: f64,

    /// Scheduler step size in epochs
    #[arg(long, default_value_t = 60)]
    step_size: usize,

    /// Scheduler decay factor
    #[arg(long, default_value_t = 0.2)]
    gamma: f64,

    /// Number of worker threads for data loading
    #[arg(long, default_value_t = 4)]
    num_workers: usize,

    /// Path to a checkpoint to resume training from
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Directory to store checkpoints
    #[arg(long, default_value = "runs")]
    output_dir: PathBuf,

    /// Seed for shuffling and augmentation
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Force training on the CPU
    #[arg(long)]
    cpu: bool,
}

impl From<Cli> for TrainConfig {
    fn from(cli: Cli) -> Self {
        Self {
            data_dir: cli.data_dir,
            batch_size: cli.batch_size,
            num_workers: cli.num_workers,
            epochs: cli.epochs,
            lr: cli.lr,
            momentum: cli.momentum,
            weight_decay: cli.weight_decay,
            step_size: cli.step_size,
            gamma: cli.gamma,
            resume: cli.resume,
            output_dir: cli.output_dir,
            seed: cli.seed,
            cpu: cli.cpu,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = TrainConfig::from(Cli::parse());
    config.validate()?;

    let data = CifarData::load(&config.data_dir)?;

    let resume = config.resume.clone();
    let mut trainer = Trainer::new(config)?;
    if let Some(checkpoint) = resume {
        trainer.resume_from(&checkpoint)?;
    }
    trainer.run(&data)?;

    Ok(())
}
