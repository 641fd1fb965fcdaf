//! Wide residual network ("Wide Residual Networks",
//! https://arxiv.org/abs/1605.07146), depth of the form 6n+4, with an
//! optional leaky-relu variant (slope 0.2).

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Dropout, Linear, Module, ModuleT, VarBuilder};

use crate::config::WideResNetConfig;
use crate::init::{self, WeightInit};
use crate::ImageClassifier;

const LEAK_SLOPE: f64 = 0.2;

fn activate(xs: &Tensor, leak: bool) -> Result<Tensor> {
    if leak {
        // leaky_relu(x) = max(x, slope * x) for slope in (0, 1)
        let scaled = xs.affine(LEAK_SLOPE, 0.0)?;
        xs.maximum(&scaled)
    } else {
        xs.relu()
    }
}

struct WideBasic {
    bn1: BatchNorm,
    conv1: Conv2d,
    dropout: Dropout,
    bn2: BatchNorm,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
    leak: bool,
}

impl WideBasic {
    fn new(
        in_planes: usize,
        planes: usize,
        dropout_rate: f32,
        stride: usize,
        leak: bool,
        weight_init: WeightInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        let slope = if leak { LEAK_SLOPE } else { 0.0 };
        let shortcut = if stride != 1 || in_planes != planes {
            Some(init::conv2d(
                in_planes,
                planes,
                1,
                stride,
                0,
                true,
                weight_init,
                slope,
                vb.pp("shortcut"),
            )?)
        } else {
            None
        };
        Ok(Self {
            bn1: init::batch_norm(in_planes, vb.pp("bn1"))?,
            conv1: init::conv2d(in_planes, planes, 3, 1, 1, true, weight_init, slope, vb.pp("conv1"))?,
            dropout: Dropout::new(dropout_rate),
            bn2: init::batch_norm(planes, vb.pp("bn2"))?,
            conv2: init::conv2d(planes, planes, 3, stride, 1, true, weight_init, slope, vb.pp("conv2"))?,
            shortcut,
            leak,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = activate(&self.bn1.forward_t(xs, train)?, self.leak)?;
        let out = self.dropout.forward(&self.conv1.forward(&out)?, train)?;
        let out = activate(&self.bn2.forward_t(&out, train)?, self.leak)?;
        let out = self.conv2.forward(&out)?;
        let residual = match &self.shortcut {
            Some(conv) => conv.forward(xs)?,
            None => xs.clone(),
        };
        out + residual
    }
}

pub struct WideResNet {
    conv1: Conv2d,
    stages: Vec<Vec<WideBasic>>,
    bn1: BatchNorm,
    linear: Linear,
    leak: bool,
}

impl WideResNet {
    pub fn new(cfg: &WideResNetConfig, weight_init: WeightInit, vb: VarBuilder) -> Result<Self> {
        let n = (cfg.depth - 4) / 6;
        let k = cfg.widen_factor;
        let widths = [16, 16 * k, 32 * k, 64 * k];

        let slope = if cfg.leak { LEAK_SLOPE } else { 0.0 };
        let conv1 = init::conv2d(3, widths[0], 3, 1, 1, true, weight_init, slope, vb.pp("conv1"))?;

        let mut stages = Vec::with_capacity(3);
        let mut in_planes = widths[0];
        for (stage, (&planes, stride)) in widths[1..].iter().zip([1usize, 2, 2]).enumerate() {
            let stage_vb = vb.pp(format!("layer{}", stage + 1));
            let mut blocks = Vec::with_capacity(n);
            for block in 0..n {
                let stride = if block == 0 { stride } else { 1 };
                blocks.push(WideBasic::new(
                    in_planes,
                    planes,
                    cfg.dropout_rate,
                    stride,
                    cfg.leak,
                    weight_init,
                    stage_vb.pp(format!("{}", block)),
                )?);
                in_planes = planes;
            }
            stages.push(blocks);
        }

        Ok(Self {
            conv1,
            stages,
            bn1: init::batch_norm_with_momentum(widths[3], 0.9, vb.pp("bn1"))?,
            linear: init::linear(widths[3], cfg.num_classes, weight_init, vb.pp("linear"))?,
            leak: cfg.leak,
        })
    }
}

impl ImageClassifier for WideResNet {
    fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = self.conv1.forward(images)?;
        for stage in &self.stages {
            for block in stage {
                out = block.forward_t(&out, train)?;
            }
        }
        let out = activate(&self.bn1.forward_t(&out, train)?, self.leak)?;
        let pooled = init::global_avg_pool(&out)?;
        self.linear.forward(&pooled)
    }
}
