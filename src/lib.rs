//! # cifar-resnet-rs
//!
//! Training pipeline for a CIFAR-adapted ResNet-18: downloads and caches the
//! dataset, augments and batches it, trains with Nesterov SGD under a
//! step-decay schedule, reports validation metrics every epoch, and keeps
//! `latest` / `best` checkpoints that a later invocation can resume from.
//!
//! ## Quick start
//!
//! ```bash
//! # Train with the default recipe
//! cifar-resnet --data-dir ./data --output-dir runs
//!
//! # Resume an interrupted run
//! cifar-resnet --resume runs/checkpoint.safetensors
//! ```
//!
//! ## Library use
//!
//! ```no_run
//! use cifar_resnet_rs::{CifarData, TrainConfig, Trainer};
//!
//! # fn main() -> cifar_resnet_rs::Result<()> {
//! let config = TrainConfig::default();
//! let data = CifarData::load(&config.data_dir)?;
//! let mut trainer = Trainer::new(config)?;
//! let best = trainer.run(&data)?;
//! println!("best validation accuracy: {best:.4}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::Checkpoint;
pub use config::TrainConfig;
pub use data::{CifarData, DataLoader};
pub use error::{Result, TrainError};
pub use model::CifarResNet;
pub use trainer::{EpochMetrics, Trainer};
