//! Run configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Configuration for one training run.
///
/// Built once from the command line, then read-only for the rest of the run.
/// Every field has a default so a config is always fully specified.
///
/// # Example
///
/// ```rust
/// use cifar_resnet_rs::TrainConfig;
///
/// let config = TrainConfig {
///     batch_size: 64,
///     epochs: 10,
///     ..Default::default()
/// };
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Directory holding (or receiving) the CIFAR-10 binary files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Examples per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Worker threads for batch preparation. 0 runs the loader inline.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Total epochs to train.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Initial learning rate.
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// SGD momentum coefficient.
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// L2 weight decay applied to all trainable parameters.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Epochs between learning-rate decay steps.
    #[serde(default = "default_step_size")]
    pub step_size: usize,

    /// Multiplicative decay factor applied every `step_size` epochs.
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    /// Checkpoint to resume from, if any.
    #[serde(default)]
    pub resume: Option<PathBuf>,

    /// Directory receiving checkpoints and the run config.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Seed for shuffling and augmentation.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Force the CPU device even when an accelerator is available.
    #[serde(default)]
    pub cpu: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_batch_size() -> usize {
    128
}
fn default_num_workers() -> usize {
    4
}
fn default_epochs() -> usize {
    120
}
fn default_lr() -> f64 {
    0.1
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    5e-4
}
fn default_step_size() -> usize {
    60
}
fn default_gamma() -> f64 {
    0.2
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}
fn default_seed() -> u64 {
    42
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
            epochs: default_epochs(),
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            step_size: default_step_size(),
            gamma: default_gamma(),
            resume: None,
            output_dir: default_output_dir(),
            seed: default_seed(),
            cpu: false,
        }
    }
}

impl TrainConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when a hyperparameter is outside its valid
    /// range.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TrainError::Config("batch_size must be > 0".into()));
        }
        if self.epochs == 0 {
            return Err(TrainError::Config("epochs must be > 0".into()));
        }
        if self.step_size == 0 {
            return Err(TrainError::Config("step_size must be > 0".into()));
        }
        if self.lr <= 0.0 {
            return Err(TrainError::Config("lr must be > 0".into()));
        }
        if self.gamma <= 0.0 {
            return Err(TrainError::Config("gamma must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(TrainError::Config("momentum must be in [0, 1)".into()));
        }
        Ok(())
    }

    /// Write the effective configuration to `path` as JSON.
    ///
    /// Saved to the output directory at run start so a checkpoint directory
    /// always records the hyperparameters that produced it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
