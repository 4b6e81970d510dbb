//! CIFAR-adapted ResNet-18.
//!
//! The standard 18-layer residual network with two structural changes for
//! 32x32 inputs: the stem convolution is 3x3 / stride 1 / padding 1 instead
//! of 7x7 / stride 2, and the initial max-pool is dropped entirely, so the
//! residual stages see 32x32 feature maps instead of 8x8. Weights start from
//! candle's default initialization; nothing is pretrained.

use candle_core::{Tensor, Var, D};
use candle_nn::{
    conv2d_no_bias, linear, Conv2d, Conv2dConfig, Init, Linear, Module, ModuleT, VarBuilder,
    VarMap,
};

use crate::error::{Result, TrainError};

/// Number of CIFAR-10 classes.
pub const NUM_CLASSES: usize = 10;

/// Channel widths of the four residual stages.
const STAGE_CHANNELS: [usize; 4] = [64, 128, 256, 512];

/// Batch normalization over the channel dimension of a NCHW tensor.
///
/// Written here rather than reusing `candle_nn::BatchNorm` because the
/// running statistics must live in the shared `VarMap`: `candle_nn`'s layer
/// copies them into private vars at construction, so a `VarMap`-based
/// checkpoint would persist the initial statistics instead of the trained
/// ones. This layer updates the map-registered vars in place.
struct BatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Var,
    running_var: Var,
    momentum: f64,
    eps: f64,
}

fn named_var(vars: &VarMap, name: &str) -> Result<Var> {
    vars.data()
        .lock()
        .unwrap()
        .get(name)
        .cloned()
        .ok_or_else(|| TrainError::Training(format!("var {name} missing from var map")))
}

fn batch_norm_2d(channels: usize, vars: &VarMap, vb: VarBuilder, prefix: &str) -> Result<BatchNorm2d> {
    let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
    // Registers the stats in the var map; the live handles come from the
    // map itself so in-place updates are visible to checkpoint saves.
    vb.get_with_hints(channels, "running_mean", Init::Const(0.0))?;
    vb.get_with_hints(channels, "running_var", Init::Const(1.0))?;
    Ok(BatchNorm2d {
        weight,
        bias,
        running_mean: named_var(vars, &format!("{prefix}.running_mean"))?,
        running_var: named_var(vars, &format!("{prefix}.running_var"))?,
        momentum: 0.1,
        eps: 1e-5,
    })
}

impl BatchNorm2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let (_b, c, _h, _w) = xs.dims4()?;
        let (mean, var) = if train {
            let mean = xs.mean_keepdim((0, 2, 3))?;
            let var = xs.broadcast_sub(&mean)?.sqr()?.mean_keepdim((0, 2, 3))?;
            self.update_running_stats(&mean, &var, xs)?;
            (mean, var)
        } else {
            (
                self.running_mean.as_tensor().reshape((1, c, 1, 1))?,
                self.running_var.as_tensor().reshape((1, c, 1, 1))?,
            )
        };
        let normed = xs
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight.reshape((1, c, 1, 1))?)?
            .broadcast_add(&self.bias.reshape((1, c, 1, 1))?)
    }

    fn update_running_stats(
        &self,
        mean: &Tensor,
        var: &Tensor,
        xs: &Tensor,
    ) -> candle_core::Result<()> {
        let (b, _c, h, w) = xs.dims4()?;
        let n = (b * h * w) as f64;
        let mean = mean.flatten_all()?.detach();
        let var = var.flatten_all()?.detach();
        // The running estimate tracks the unbiased variance.
        let var = if n > 1.0 { (var * (n / (n - 1.0)))? } else { var };
        let new_mean = ((self.running_mean.as_tensor() * (1.0 - self.momentum))?
            + (mean * self.momentum)?)?;
        let new_var =
            ((self.running_var.as_tensor() * (1.0 - self.momentum))? + (var * self.momentum)?)?;
        self.running_mean.set(&new_mean)?;
        self.running_var.set(&new_var)
    }
}

/// Two 3x3 convolutions with a residual connection.
struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    /// 1x1 projection for the identity path when the shape changes.
    downsample: Option<(Conv2d, BatchNorm2d)>,
}

fn basic_block(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    vars: &VarMap,
    vb: VarBuilder,
    prefix: &str,
) -> Result<BasicBlock> {
    let conv1 = conv2d_no_bias(
        in_channels,
        out_channels,
        3,
        Conv2dConfig {
            stride,
            padding: 1,
            ..Default::default()
        },
        vb.pp("conv1"),
    )?;
    let bn1 = batch_norm_2d(out_channels, vars, vb.pp("bn1"), &format!("{prefix}.bn1"))?;
    let conv2 = conv2d_no_bias(
        out_channels,
        out_channels,
        3,
        Conv2dConfig {
            padding: 1,
            ..Default::default()
        },
        vb.pp("conv2"),
    )?;
    let bn2 = batch_norm_2d(out_channels, vars, vb.pp("bn2"), &format!("{prefix}.bn2"))?;

    let downsample = if stride != 1 || in_channels != out_channels {
        let conv = conv2d_no_bias(
            in_channels,
            out_channels,
            1,
            Conv2dConfig {
                stride,
                ..Default::default()
            },
            vb.pp("downsample.0"),
        )?;
        let bn = batch_norm_2d(
            out_channels,
            vars,
            vb.pp("downsample.1"),
            &format!("{prefix}.downsample.1"),
        )?;
        Some((conv, bn))
    } else {
        None
    };

    Ok(BasicBlock {
        conv1,
        bn1,
        conv2,
        bn2,
        downsample,
    })
}

impl BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, train)?;
        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        (out + identity)?.relu()
    }
}

/// ResNet-18 mapping a normalized image batch to 10-way class logits.
pub struct CifarResNet {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    stages: Vec<Vec<BasicBlock>>,
    fc: Linear,
}

impl CifarResNet {
    /// Build the network, registering every parameter in `vars`.
    ///
    /// `vb` must be backed by the same var map (see
    /// `VarBuilder::from_varmap`); the map is also consulted directly for
    /// the batch-norm running-statistic handles.
    ///
    /// # Errors
    ///
    /// Returns an error if parameter creation fails.
    pub fn new(vars: &VarMap, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv2d_no_bias(
            3,
            STAGE_CHANNELS[0],
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let bn1 = batch_norm_2d(STAGE_CHANNELS[0], vars, vb.pp("bn1"), "bn1")?;

        let mut stages = Vec::with_capacity(STAGE_CHANNELS.len());
        let mut in_channels = STAGE_CHANNELS[0];
        for (idx, &out_channels) in STAGE_CHANNELS.iter().enumerate() {
            let name = format!("layer{}", idx + 1);
            let stride = if idx == 0 { 1 } else { 2 };
            let first = basic_block(
                in_channels,
                out_channels,
                stride,
                vars,
                vb.pp(&name).pp("0"),
                &format!("{name}.0"),
            )?;
            let second = basic_block(
                out_channels,
                out_channels,
                1,
                vars,
                vb.pp(&name).pp("1"),
                &format!("{name}.1"),
            )?;
            stages.push(vec![first, second]);
            in_channels = out_channels;
        }

        let fc = linear(STAGE_CHANNELS[3], NUM_CLASSES, vb.pp("fc"))?;

        Ok(Self {
            conv1,
            bn1,
            stages,
            fc,
        })
    }
}

impl ModuleT for CifarResNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut out = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        for stage in &self.stages {
            for block in stage {
                out = block.forward_t(&out, train)?;
            }
        }
        // Global average pool over the spatial dimensions.
        let pooled = out.mean(D::Minus1)?.mean(D::Minus1)?;
        self.fc.forward(&pooled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn build() -> (VarMap, CifarResNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CifarResNet::new(&varmap, vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn test_forward_shape() {
        let (_varmap, model) = build();
        let xs = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();

        let logits = model.forward_t(&xs, true).unwrap();
        assert_eq!(logits.dims(), &[2, NUM_CLASSES]);

        let logits = model.forward_t(&xs, false).unwrap();
        assert_eq!(logits.dims(), &[2, NUM_CLASSES]);
    }

    #[test]
    fn test_parameter_names() {
        let (varmap, _model) = build();
        let data = varmap.data().lock().unwrap();
        for name in [
            "conv1.weight",
            "bn1.weight",
            "bn1.running_mean",
            "layer1.0.conv1.weight",
            "layer2.0.downsample.0.weight",
            "layer4.1.bn2.running_var",
            "fc.weight",
            "fc.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        // Stage 1 keeps the stem resolution, so its first block has no
        // projection on the identity path.
        assert!(!data.contains_key("layer1.0.downsample.0.weight"));
    }

    #[test]
    fn test_training_updates_map_registered_stats() {
        let (varmap, model) = build();
        let xs = Tensor::rand(0f32, 1f32, (4, 3, 32, 32), &Device::Cpu).unwrap();

        model.forward_t(&xs, true).unwrap();

        let data = varmap.data().lock().unwrap();
        let mean = data
            .get("bn1.running_mean")
            .unwrap()
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        // Initialized to zero; a training forward over nonzero inputs must
        // have moved it, and the change must be visible through the map.
        assert!(mean.iter().any(|&v| v.abs() > 0.0));
    }

    #[test]
    fn test_eval_leaves_stats_untouched() {
        let (varmap, model) = build();
        let xs = Tensor::rand(0f32, 1f32, (4, 3, 32, 32), &Device::Cpu).unwrap();

        model.forward_t(&xs, false).unwrap();

        let data = varmap.data().lock().unwrap();
        let mean = data
            .get("bn1.running_mean")
            .unwrap()
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        assert!(mean.iter().all(|&v| v == 0.0));
    }
}
