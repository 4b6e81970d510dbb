//! SGD optimizer with Nesterov momentum and L2 weight decay.
//!
//! `candle_nn` ships a momentum-free SGD, which is not what a ResNet recipe
//! calls for, so the update rule is implemented here on top of candle's
//! gradient store. The semantics match `torch.optim.SGD` with
//! `nesterov=true`: decay is folded into the gradient, the velocity buffer
//! is seeded with the first decayed gradient, and the applied direction is
//! `g + momentum * v`.

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::{Result, TrainError};

/// Optimizer hyperparameters.
#[derive(Debug, Clone)]
pub struct SgdConfig {
    /// Learning rate.
    pub learning_rate: f64,
    /// Momentum coefficient. 0 disables the velocity buffer.
    pub momentum: f64,
    /// L2 weight decay.
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

impl SgdConfig {
    /// Build an SGD optimizer over the trainable vars of `varmap`.
    ///
    /// Batch-norm running statistics (`*.running_mean` / `*.running_var`)
    /// live in the same var map but are state, not parameters: they are
    /// excluded so weight decay never touches them. Parameters are ordered
    /// by name so optimizer state maps deterministically across runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the var map holds no trainable parameters.
    pub fn build(&self, varmap: &VarMap) -> Result<SgdOptimizer> {
        let data = varmap.data().lock().unwrap();
        let mut params: Vec<ParamState> = data
            .iter()
            .filter(|(name, _)| !is_running_stat(name))
            .map(|(name, var)| ParamState {
                name: name.clone(),
                var: var.clone(),
                velocity: None,
            })
            .collect();
        drop(data);

        if params.is_empty() {
            return Err(TrainError::Training(
                "no trainable parameters in var map".into(),
            ));
        }
        params.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(SgdOptimizer {
            params,
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
        })
    }
}

fn is_running_stat(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

/// One parameter tracked by the optimizer.
struct ParamState {
    name: String,
    var: Var,
    /// Momentum buffer, allocated lazily on the first step.
    velocity: Option<Var>,
}

/// SGD with Nesterov momentum.
pub struct SgdOptimizer {
    params: Vec<ParamState>,
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
}

impl SgdOptimizer {
    /// Compute gradients of `loss` and apply one update in place.
    ///
    /// Mutates model parameters and the velocity buffers; nothing else.
    ///
    /// # Errors
    ///
    /// Returns an error if backpropagation or a tensor update fails.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss
            .backward()
            .map_err(|e| TrainError::Training(format!("backward pass failed: {e}")))?;

        for param in &mut self.params {
            let Some(grad) = grads.get(param.var.as_tensor()) else {
                continue;
            };

            let mut update = if self.weight_decay > 0.0 {
                (grad + (param.var.as_tensor() * self.weight_decay)?)?
            } else {
                grad.clone()
            };

            if self.momentum > 0.0 {
                let velocity = match &param.velocity {
                    Some(buf) => {
                        let next = ((buf.as_tensor() * self.momentum)? + &update)?;
                        buf.set(&next)?;
                        next
                    }
                    None => {
                        let buf = Var::from_tensor(&update)?;
                        let next = buf.as_tensor().clone();
                        param.velocity = Some(buf);
                        next
                    }
                };
                // Nesterov look-ahead direction.
                update = (&update + (velocity * self.momentum)?)?;
            }

            let next = param
                .var
                .as_tensor()
                .sub(&(update * self.learning_rate)?)?;
            param.var.set(&next)?;
        }
        Ok(())
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Set the learning rate (used by the scheduler).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    /// Number of tracked parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Total number of scalar weights under optimization.
    #[must_use]
    pub fn weight_count(&self) -> usize {
        self.params.iter().map(|p| p.var.elem_count()).sum()
    }

    /// Snapshot the velocity buffers, keyed by parameter name.
    ///
    /// Parameters that have not been stepped yet have no buffer and are
    /// absent from the map.
    #[must_use]
    pub fn state(&self) -> HashMap<String, Tensor> {
        self.params
            .iter()
            .filter_map(|p| {
                p.velocity
                    .as_ref()
                    .map(|v| (p.name.clone(), v.as_tensor().clone()))
            })
            .collect()
    }

    /// Restore velocity buffers from a checkpoint snapshot.
    ///
    /// # Errors
    ///
    /// Returns a `Checkpoint` error when a stored buffer names an unknown
    /// parameter or its shape disagrees with the parameter it belongs to.
    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for (name, tensor) in state {
            let param = self
                .params
                .iter_mut()
                .find(|p| &p.name == name)
                .ok_or_else(|| {
                    TrainError::Checkpoint(format!("optimizer state for unknown parameter {name}"))
                })?;
            if param.var.dims() != tensor.dims() {
                return Err(TrainError::Checkpoint(format!(
                    "optimizer state shape mismatch for {name}: {:?} vs {:?}",
                    tensor.dims(),
                    param.var.dims()
                )));
            }
            param.velocity = Some(Var::from_tensor(tensor)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    fn single_param_map(value: f32) -> (VarMap, Var) {
        let varmap = VarMap::new();
        varmap
            .get(1, "w", Init::Const(value as f64), DType::F32, &Device::Cpu)
            .unwrap();
        let var = varmap.data().lock().unwrap().get("w").unwrap().clone();
        (varmap, var)
    }

    fn loss_of(var: &Var) -> Tensor {
        // loss = 0.5 * w^2, so d(loss)/dw = w
        (var.as_tensor().sqr().unwrap() * 0.5).unwrap().sum_all().unwrap()
    }

    #[test]
    fn test_plain_sgd_step() {
        let (varmap, var) = single_param_map(1.0);
        let config = SgdConfig {
            learning_rate: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
        };
        let mut opt = config.build(&varmap).unwrap();

        opt.backward_step(&loss_of(&var)).unwrap();

        // w <- w - lr * w = 1.0 - 0.1 * 1.0
        let w = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((w - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_weight_decay_folds_into_gradient() {
        let (varmap, var) = single_param_map(1.0);
        let config = SgdConfig {
            learning_rate: 0.1,
            momentum: 0.0,
            weight_decay: 0.5,
        };
        let mut opt = config.build(&varmap).unwrap();

        opt.backward_step(&loss_of(&var)).unwrap();

        // g = w + wd * w = 1.5; w <- 1.0 - 0.1 * 1.5
        let w = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((w - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_nesterov_momentum_two_steps() {
        let (varmap, var) = single_param_map(1.0);
        let config = SgdConfig {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
        };
        let mut opt = config.build(&varmap).unwrap();

        // Step 1: g = 1.0, v = 1.0, d = g + m*v = 1.9, w = 1.0 - 0.19 = 0.81
        opt.backward_step(&loss_of(&var)).unwrap();
        let w = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((w - 0.81).abs() < 1e-6);

        // Step 2: g = 0.81, v = 0.9*1.0 + 0.81 = 1.71,
        // d = 0.81 + 0.9*1.71 = 2.349, w = 0.81 - 0.2349 = 0.5751
        opt.backward_step(&loss_of(&var)).unwrap();
        let w = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((w - 0.5751).abs() < 1e-5);
    }

    #[test]
    fn test_running_stats_are_excluded() {
        let varmap = VarMap::new();
        let device = Device::Cpu;
        varmap
            .get(4, "bn1.weight", Init::Const(1.0), DType::F32, &device)
            .unwrap();
        varmap
            .get(4, "bn1.running_mean", Init::Const(0.0), DType::F32, &device)
            .unwrap();
        varmap
            .get(4, "bn1.running_var", Init::Const(1.0), DType::F32, &device)
            .unwrap();

        let opt = SgdConfig::default().build(&varmap).unwrap();
        assert_eq!(opt.param_count(), 1);
    }

    #[test]
    fn test_build_rejects_empty_varmap() {
        let varmap = VarMap::new();
        assert!(SgdConfig::default().build(&varmap).is_err());
    }

    #[test]
    fn test_state_roundtrip() {
        let (varmap, var) = single_param_map(1.0);
        let config = SgdConfig {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
        };
        let mut opt = config.build(&varmap).unwrap();
        opt.backward_step(&loss_of(&var)).unwrap();

        let state = opt.state();
        assert_eq!(state.len(), 1);
        let saved = state.get("w").unwrap().to_vec1::<f32>().unwrap();

        // Fresh optimizer over a fresh map, restore, and compare buffers.
        let (varmap2, _var2) = single_param_map(1.0);
        let mut opt2 = config.build(&varmap2).unwrap();
        opt2.load_state(&state).unwrap();
        let restored = opt2.state().get("w").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(saved, restored);
    }

    #[test]
    fn test_load_state_rejects_unknown_param() {
        let (varmap, _var) = single_param_map(1.0);
        let mut opt = SgdConfig::default().build(&varmap).unwrap();

        let mut state = HashMap::new();
        state.insert(
            "nope".to_string(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            opt.load_state(&state),
            Err(TrainError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_load_state_rejects_shape_mismatch() {
        let (varmap, _var) = single_param_map(1.0);
        let mut opt = SgdConfig::default().build(&varmap).unwrap();

        let mut state = HashMap::new();
        state.insert(
            "w".to_string(),
            Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            opt.load_state(&state),
            Err(TrainError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_set_learning_rate() {
        let (varmap, _var) = single_param_map(1.0);
        let mut opt = SgdConfig::default().build(&varmap).unwrap();
        assert_eq!(opt.learning_rate(), 0.1);
        opt.set_learning_rate(0.02);
        assert_eq!(opt.learning_rate(), 0.02);
    }
}
