//! Checkpoint save/restore with an explicit tensor schema.
//!
//! A checkpoint is a single safetensors file with four key families:
//!
//! - `model.<name>` - every var-map tensor (trainable parameters plus
//!   batch-norm running statistics)
//! - `optim.<name>` - optimizer velocity buffers
//! - `meta.epoch`   - completed epochs, u32
//! - `meta.best_acc` - best validation accuracy seen so far, f32
//!
//! Two slots exist in the output directory: `checkpoint.safetensors`
//! (overwritten every epoch) and `best.safetensors` (overwritten only on a
//! strict validation-accuracy improvement). Saves go through a temp file and
//! a rename, so an interrupted run can leave the latest slot one epoch stale
//! but never truncated.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;

use crate::error::{Result, TrainError};

/// File name of the latest-checkpoint slot.
pub const LATEST_FILE: &str = "checkpoint.safetensors";
/// File name of the best-checkpoint slot.
pub const BEST_FILE: &str = "best.safetensors";

const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";
const META_EPOCH: &str = "meta.epoch";
const META_BEST_ACC: &str = "meta.best_acc";

/// A snapshot of training progress sufficient to resume.
#[derive(Debug)]
pub struct Checkpoint {
    /// Number of completed epochs; the next epoch to run on resume.
    pub epoch: usize,
    /// Best validation accuracy observed so far.
    pub best_accuracy: f64,
    /// Model tensors keyed by var-map name.
    pub model: HashMap<String, Tensor>,
    /// Optimizer velocity buffers keyed by parameter name.
    pub optimizer: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Serialize to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (name, tensor) in &self.model {
            tensors.insert(format!("{MODEL_PREFIX}{name}"), tensor.clone());
        }
        for (name, tensor) in &self.optimizer {
            tensors.insert(format!("{OPTIM_PREFIX}{name}"), tensor.clone());
        }
        let cpu = Device::Cpu;
        tensors.insert(
            META_EPOCH.to_string(),
            Tensor::from_vec(vec![self.epoch as u32], 1, &cpu)?,
        );
        tensors.insert(
            META_BEST_ACC.to_string(),
            Tensor::from_vec(vec![self.best_accuracy as f32], 1, &cpu)?,
        );

        // Full write into a sibling temp file, then an atomic rename over
        // the slot.
        let tmp = path.with_extension("safetensors.tmp");
        candle_core::safetensors::save(&tensors, &tmp)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Deserialize a checkpoint from `path`, placing tensors on `device`.
    ///
    /// # Errors
    ///
    /// Returns a `Checkpoint` error if the file is absent, unreadable, or
    /// missing the `meta.*` keys.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TrainError::Checkpoint(format!(
                "checkpoint not found: {}",
                path.display()
            )));
        }

        let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
            TrainError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;

        let epoch = scalar_u32(&tensors, META_EPOCH)? as usize;
        let best_accuracy = f64::from(scalar_f32(&tensors, META_BEST_ACC)?);

        let mut model = HashMap::new();
        let mut optimizer = HashMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
                model.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(OPTIM_PREFIX) {
                optimizer.insert(name.to_string(), tensor);
            }
        }

        Ok(Self {
            epoch,
            best_accuracy,
            model,
            optimizer,
        })
    }
}

fn scalar_u32(tensors: &HashMap<String, Tensor>, key: &str) -> Result<u32> {
    let tensor = tensors
        .get(key)
        .ok_or_else(|| TrainError::Checkpoint(format!("missing required field {key}")))?;
    let values = tensor
        .to_dtype(DType::U32)?
        .flatten_all()?
        .to_vec1::<u32>()?;
    values
        .first()
        .copied()
        .ok_or_else(|| TrainError::Checkpoint(format!("empty field {key}")))
}

fn scalar_f32(tensors: &HashMap<String, Tensor>, key: &str) -> Result<f32> {
    let tensor = tensors
        .get(key)
        .ok_or_else(|| TrainError::Checkpoint(format!("missing required field {key}")))?;
    let values = tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    values
        .first()
        .copied()
        .ok_or_else(|| TrainError::Checkpoint(format!("empty field {key}")))
}

/// Snapshot every tensor in the var map, keyed by name.
#[must_use]
pub fn model_state(varmap: &VarMap) -> HashMap<String, Tensor> {
    varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect()
}

/// Load a stored model state into a live var map.
///
/// The stored key set must match the var map exactly and every shape must
/// agree; a mismatch means the checkpoint was produced by a different
/// architecture and is rejected rather than partially applied.
///
/// # Errors
///
/// Returns a `Checkpoint` error on any missing, extra, or misshapen tensor.
pub fn apply_model_state(varmap: &VarMap, state: &HashMap<String, Tensor>) -> Result<()> {
    let data = varmap.data().lock().unwrap();

    for name in state.keys() {
        if !data.contains_key(name) {
            return Err(TrainError::Checkpoint(format!(
                "stored tensor {name} has no counterpart in the model"
            )));
        }
    }
    for (name, var) in data.iter() {
        let tensor = state.get(name).ok_or_else(|| {
            TrainError::Checkpoint(format!("model tensor {name} missing from checkpoint"))
        })?;
        if var.dims() != tensor.dims() {
            return Err(TrainError::Checkpoint(format!(
                "shape mismatch for {name}: checkpoint {:?} vs model {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
    }
    for (name, var) in data.iter() {
        var.set(&state[name].to_dtype(var.dtype())?)?;
    }
    Ok(())
}
