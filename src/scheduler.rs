//! Step-decay learning-rate schedule.

use crate::optimizer::SgdOptimizer;

/// Multiplies the base learning rate by `gamma` once every `step_size`
/// epochs. A step decay, not a continuous one: the rate is constant within
/// a window and drops at window boundaries.
#[derive(Debug, Clone)]
pub struct StepDecay {
    /// Learning rate before any decay.
    base_lr: f64,
    /// Decay factor per window.
    gamma: f64,
    /// Epochs per window.
    step_size: usize,
    /// Completed epochs; determines the current window.
    epochs_completed: usize,
}

impl StepDecay {
    /// Create a schedule positioned at epoch 0.
    #[must_use]
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            gamma,
            step_size,
            epochs_completed: 0,
        }
    }

    /// Learning rate for the epoch about to run.
    #[must_use]
    pub fn lr(&self) -> f64 {
        let windows = (self.epochs_completed / self.step_size) as i32;
        self.base_lr * self.gamma.powi(windows)
    }

    /// Record one completed epoch and push the new rate into the optimizer.
    pub fn step(&mut self, optimizer: &mut SgdOptimizer) {
        self.epochs_completed += 1;
        optimizer.set_learning_rate(self.lr());
    }

    /// Reposition the schedule after a checkpoint load so the next epoch
    /// sees exactly the rate an uninterrupted run would have used.
    pub fn resume(&mut self, epochs_completed: usize, optimizer: &mut SgdOptimizer) {
        self.epochs_completed = epochs_completed;
        optimizer.set_learning_rate(self.lr());
    }

    /// Completed-epoch counter.
    #[must_use]
    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }
}
