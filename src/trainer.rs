//! Training loop and run controller.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{loss, ModuleT, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{self, Checkpoint, BEST_FILE, LATEST_FILE};
use crate::config::TrainConfig;
use crate::data::{CifarData, DataLoader, LoaderOptions};
use crate::error::{Result, TrainError};
use crate::model::CifarResNet;
use crate::optimizer::{SgdConfig, SgdOptimizer};
use crate::scheduler::StepDecay;

/// Loss and accuracy over one full pass of a split.
///
/// Exact per-example averages: batch totals are weighted by batch size, so
/// a ragged final batch does not skew the result.
#[derive(Debug, Clone, Copy)]
pub struct EpochMetrics {
    /// Mean cross-entropy loss per example.
    pub loss: f64,
    /// Fraction of examples whose arg-max logit matches the label.
    pub accuracy: f64,
}

/// Accumulates batch-level results into an exact per-example average.
#[derive(Debug, Default)]
struct MetricsAccumulator {
    loss_sum: f64,
    correct: usize,
    examples: usize,
}

impl MetricsAccumulator {
    /// Fold in one batch: its mean loss, correct-prediction count, and size.
    fn record(&mut self, batch_loss: f64, correct: usize, examples: usize) {
        self.loss_sum += batch_loss * examples as f64;
        self.correct += correct;
        self.examples += examples;
    }

    fn finish(&self) -> EpochMetrics {
        if self.examples == 0 {
            return EpochMetrics {
                loss: 0.0,
                accuracy: 0.0,
            };
        }
        EpochMetrics {
            loss: self.loss_sum / self.examples as f64,
            accuracy: self.correct as f64 / self.examples as f64,
        }
    }
}

/// Count examples whose arg-max logit equals the label.
fn correct_predictions(logits: &Tensor, labels: &Tensor) -> Result<usize> {
    let predictions = logits.argmax(D::Minus1)?;
    let matches = predictions
        .eq(labels)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(matches as usize)
}

/// Training orchestrator: owns the model, optimizer, schedule, and the
/// best-accuracy bookkeeping for one run.
pub struct Trainer {
    config: TrainConfig,
    device: Device,
    varmap: VarMap,
    model: CifarResNet,
    optimizer: SgdOptimizer,
    scheduler: StepDecay,
    /// First epoch index to execute; nonzero after a resume.
    start_epoch: usize,
    /// Best validation accuracy seen so far. Monotonically non-decreasing.
    best_accuracy: f64,
}

impl Trainer {
    /// Validate the configuration and build a fresh training state.
    ///
    /// Prefers the accelerator when one is available; a missing or broken
    /// CUDA setup degrades to the CPU with a warning instead of failing.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or model
    /// construction fails.
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;

        let device = if config.cpu {
            tracing::info!("training device: CPU (forced)");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(device @ Device::Cuda(_)) => {
                    tracing::info!("training device: CUDA");
                    device
                }
                Ok(_) => {
                    tracing::warn!("CUDA not available; falling back to CPU");
                    Device::Cpu
                }
                Err(err) => {
                    tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                    Device::Cpu
                }
            }
        };

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CifarResNet::new(&varmap, vb)?;

        let optimizer = SgdConfig {
            learning_rate: config.lr,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
        }
        .build(&varmap)?;
        tracing::info!(
            "initialized SGD over {} tensors ({} weights), lr={}, momentum={}, nesterov",
            optimizer.param_count(),
            optimizer.weight_count(),
            config.lr,
            config.momentum
        );

        let scheduler = StepDecay::new(config.lr, config.step_size, config.gamma);

        Ok(Self {
            config,
            device,
            varmap,
            model,
            optimizer,
            scheduler,
            start_epoch: 0,
            best_accuracy: 0.0,
        })
    }

    /// Resume from a checkpoint: restore model and optimizer state, rewind
    /// the schedule, and position the controller so the next epoch executed
    /// is the one after the stored epoch.
    ///
    /// # Errors
    ///
    /// Returns a `Checkpoint` error if the file is absent, malformed, or
    /// shaped for a different architecture.
    pub fn resume_from(&mut self, path: &std::path::Path) -> Result<()> {
        let loaded = Checkpoint::load(path, &self.device)?;
        checkpoint::apply_model_state(&self.varmap, &loaded.model)?;
        self.optimizer.load_state(&loaded.optimizer)?;
        self.scheduler.resume(loaded.epoch, &mut self.optimizer);
        self.start_epoch = loaded.epoch;
        self.best_accuracy = loaded.best_accuracy;
        tracing::info!(
            "resumed from {} (completed epochs: {}, best acc: {:.4})",
            path.display(),
            loaded.epoch,
            loaded.best_accuracy
        );
        Ok(())
    }

    /// Run the epoch loop to completion and return the best validation
    /// accuracy observed across the run.
    ///
    /// Per epoch: one training pass, one evaluation pass, a schedule step,
    /// an unconditional latest-checkpoint write, a conditional best write,
    /// and one metrics line on stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if a batch fails to load, a training step fails, or
    /// a checkpoint cannot be written.
    pub fn run(&mut self, data: &CifarData) -> Result<f64> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        self.config
            .to_file(self.config.output_dir.join("config.json"))?;
        self.optimizer.set_learning_rate(self.scheduler.lr());

        for epoch in self.start_epoch..self.config.epochs {
            let train_loader = DataLoader::new(
                data.train.clone(),
                LoaderOptions {
                    batch_size: self.config.batch_size,
                    num_workers: self.config.num_workers,
                    augment: true,
                    shuffle_seed: Some(self.config.seed.wrapping_add(epoch as u64)),
                    device: self.device.clone(),
                },
            );
            let train_metrics = self.train_one_epoch(train_loader)?;

            let val_loader = DataLoader::new(
                data.val.clone(),
                LoaderOptions {
                    batch_size: self.config.batch_size,
                    num_workers: self.config.num_workers,
                    augment: false,
                    shuffle_seed: None,
                    device: self.device.clone(),
                },
            );
            let val_metrics = self.evaluate(val_loader)?;

            self.scheduler.step(&mut self.optimizer);
            let improved = self.update_best(val_metrics.accuracy);
            self.save_checkpoints(epoch + 1, improved)?;

            println!(
                "Epoch {}/{} - Train Loss: {:.4}, Train Acc: {:.4}, Val Loss: {:.4}, Val Acc: {:.4}",
                epoch + 1,
                self.config.epochs,
                train_metrics.loss,
                train_metrics.accuracy,
                val_metrics.loss,
                val_metrics.accuracy
            );
            tracing::info!(
                epoch = epoch + 1,
                lr = self.optimizer.learning_rate(),
                val_acc = val_metrics.accuracy,
                best_acc = self.best_accuracy,
                "epoch complete"
            );
        }

        println!(
            "Training complete. Best validation accuracy: {:.4}",
            self.best_accuracy
        );
        Ok(self.best_accuracy)
    }

    /// One full pass over the training loader: forward, cross-entropy loss,
    /// backward, Nesterov SGD update per batch. Mutates model parameters
    /// and optimizer state in place.
    fn train_one_epoch(&mut self, loader: DataLoader) -> Result<EpochMetrics> {
        let progress = ProgressBar::new(loader.num_batches() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} loss {msg}")
                .map_err(|e| TrainError::Training(format!("progress template: {e}")))?
                .progress_chars("#>-"),
        );

        let mut metrics = MetricsAccumulator::default();
        for batch in loader {
            let batch = batch?;
            let logits = self.model.forward_t(&batch.images, true)?;
            let loss = loss::cross_entropy(&logits, &batch.labels)?;
            self.optimizer.backward_step(&loss)?;

            let batch_loss = f64::from(loss.to_scalar::<f32>()?);
            let correct = correct_predictions(&logits, &batch.labels)?;
            metrics.record(batch_loss, correct, batch.len());

            progress.set_message(format!("{batch_loss:.4}"));
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(metrics.finish())
    }

    /// One full pass over a loader with the model in evaluation mode:
    /// normalization layers use their running statistics and no parameter
    /// or optimizer state is touched.
    pub fn evaluate(&self, loader: DataLoader) -> Result<EpochMetrics> {
        let mut metrics = MetricsAccumulator::default();
        for batch in loader {
            let batch = batch?;
            let logits = self.model.forward_t(&batch.images, false)?;
            let loss = loss::cross_entropy(&logits, &batch.labels)?;

            let batch_loss = f64::from(loss.to_scalar::<f32>()?);
            let correct = correct_predictions(&logits, &batch.labels)?;
            metrics.record(batch_loss, correct, batch.len());
        }
        Ok(metrics.finish())
    }

    /// Record this epoch's validation accuracy; true when it strictly beats
    /// every previous epoch.
    fn update_best(&mut self, accuracy: f64) -> bool {
        if accuracy > self.best_accuracy {
            self.best_accuracy = accuracy;
            true
        } else {
            false
        }
    }

    /// Write the latest slot unconditionally and the best slot on
    /// improvement. `completed_epochs` counts finished epochs, so a resume
    /// from this checkpoint continues with the next one.
    fn save_checkpoints(&self, completed_epochs: usize, improved: bool) -> Result<()> {
        let snapshot = Checkpoint {
            epoch: completed_epochs,
            best_accuracy: self.best_accuracy,
            model: checkpoint::model_state(&self.varmap),
            optimizer: self.optimizer.state(),
        };
        snapshot.save(self.config.output_dir.join(LATEST_FILE))?;
        if improved {
            snapshot.save(self.config.output_dir.join(BEST_FILE))?;
            tracing::info!("new best accuracy {:.4}", self.best_accuracy);
        }
        Ok(())
    }

    /// Best validation accuracy observed so far.
    #[must_use]
    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    /// Index of the next epoch to execute.
    #[must_use]
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CifarDataset, IMAGE_BYTES};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_config(output_dir: &std::path::Path) -> TrainConfig {
        TrainConfig {
            batch_size: 4,
            num_workers: 0,
            epochs: 4,
            step_size: 2,
            output_dir: output_dir.to_path_buf(),
            cpu: true,
            ..Default::default()
        }
    }

    fn synthetic_loader(count: usize, batch_size: usize) -> DataLoader {
        let mut images = Vec::with_capacity(count * IMAGE_BYTES);
        let mut labels = Vec::with_capacity(count);
        for i in 0..count {
            images.extend(std::iter::repeat(((i * 37) % 251) as u8).take(IMAGE_BYTES));
            labels.push((i % 10) as u8);
        }
        let dataset = Arc::new(CifarDataset::from_raw(images, labels).unwrap());
        DataLoader::new(
            dataset,
            LoaderOptions {
                batch_size,
                num_workers: 0,
                augment: false,
                shuffle_seed: None,
                device: Device::Cpu,
            },
        )
    }

    #[test]
    fn test_weighted_running_average() {
        // Batches of sizes [3, 5, 2] with per-batch means [1.0, 0.5, 2.0]:
        // the epoch value must be sum(mi * ni) / sum(ni), not the mean of
        // the batch means.
        let mut acc = MetricsAccumulator::default();
        acc.record(1.0, 3, 3);
        acc.record(0.5, 2, 5);
        acc.record(2.0, 1, 2);

        let metrics = acc.finish();
        let expected_loss = (1.0 * 3.0 + 0.5 * 5.0 + 2.0 * 2.0) / 10.0;
        assert!((metrics.loss - expected_loss).abs() < 1e-12);
        assert!((metrics.accuracy - 6.0 / 10.0).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&metrics.accuracy));
    }

    #[test]
    fn test_empty_accumulator() {
        let metrics = MetricsAccumulator::default().finish();
        assert_eq!(metrics.loss, 0.0);
        assert_eq!(metrics.accuracy, 0.0);
    }

    #[test]
    fn test_correct_predictions_exact() {
        // Rows 0 and 2 predict classes 1 and 0; labels are [1, 1, 2].
        let logits = Tensor::from_vec(
            vec![0.1f32, 2.0, 0.3, 1.5, 0.2, 0.9, 3.0, 0.1, 0.2],
            (3, 3),
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::from_vec(vec![1u32, 1, 2], 3, &Device::Cpu).unwrap();

        assert_eq!(correct_predictions(&logits, &labels).unwrap(), 1);
    }

    #[test]
    fn test_best_is_strictly_improving() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(test_config(dir.path())).unwrap();

        // Accuracy sequence [0.5, 0.4, 0.6, 0.6] writes best at epochs 1
        // and 3 only.
        let decisions: Vec<bool> = [0.5, 0.4, 0.6, 0.6]
            .iter()
            .map(|&acc| trainer.update_best(acc))
            .collect();
        assert_eq!(decisions, vec![true, false, true, false]);
        assert!((trainer.best_accuracy() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_never_mutates_parameters() {
        let dir = TempDir::new().unwrap();
        let trainer = Trainer::new(test_config(dir.path())).unwrap();

        let before = checkpoint::model_state(&trainer.varmap);
        trainer.evaluate(synthetic_loader(8, 4)).unwrap();
        let after = checkpoint::model_state(&trainer.varmap);

        assert_eq!(before.len(), after.len());
        for (name, tensor) in &before {
            let a = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = after[name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(a, b, "evaluate mutated {name}");
        }
    }

    #[test]
    fn test_evaluate_metrics_are_exact_fractions() {
        let dir = TempDir::new().unwrap();
        let trainer = Trainer::new(test_config(dir.path())).unwrap();

        let metrics = trainer.evaluate(synthetic_loader(10, 4)).unwrap();
        assert!((0.0..=1.0).contains(&metrics.accuracy));
        // With 10 examples, accuracy must be an exact tenth.
        let scaled = metrics.accuracy * 10.0;
        assert!((scaled - scaled.round()).abs() < 1e-9);
    }

    #[test]
    fn test_training_step_changes_parameters() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(test_config(dir.path())).unwrap();

        let before = checkpoint::model_state(&trainer.varmap);
        trainer.train_one_epoch(synthetic_loader(8, 4)).unwrap();
        let after = checkpoint::model_state(&trainer.varmap);

        let a = before["fc.weight"].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = after["fc.weight"].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_resume_positions_next_epoch_and_schedule() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());

        // First run: pretend three epochs completed, two schedule steps
        // behind one improvement.
        let mut first = Trainer::new(config.clone()).unwrap();
        for _ in 0..3 {
            first.scheduler.step(&mut first.optimizer);
        }
        first.update_best(0.42);
        first.save_checkpoints(3, true).unwrap();

        // Second invocation resumes from the latest slot.
        let mut second = Trainer::new(config.clone()).unwrap();
        second
            .resume_from(&config.output_dir.join(LATEST_FILE))
            .unwrap();

        assert_eq!(second.start_epoch(), 3);
        assert!((second.best_accuracy() - 0.42).abs() < 1e-6);
        // The schedule and the optimizer rate match an uninterrupted run.
        assert_eq!(second.scheduler.epochs_completed(), 3);
        assert!((second.optimizer.learning_rate() - first.optimizer.learning_rate()).abs() < 1e-12);

        // Model tensors match the saved run exactly.
        let saved = checkpoint::model_state(&first.varmap);
        let restored = checkpoint::model_state(&second.varmap);
        for (name, tensor) in &saved {
            assert_eq!(
                tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                restored[name].flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                "tensor {name} differs after resume"
            );
        }
    }

    #[test]
    fn test_resume_from_missing_checkpoint_fails() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(test_config(dir.path())).unwrap();
        let result = trainer.resume_from(&dir.path().join("nope.safetensors"));
        assert!(matches!(result, Err(TrainError::Checkpoint(_))));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = TrainConfig {
            batch_size: 0,
            ..test_config(dir.path())
        };
        assert!(matches!(Trainer::new(config), Err(TrainError::Config(_))));
    }
}
