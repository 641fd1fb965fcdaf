//! Densenet-BC ("Densely Connected Convolutional Networks",
//! https://arxiv.org/pdf/1608.06993.pdf) with the CIFAR-style 3x3 stem used
//! for small inputs.

use candle_core::{Result, Tensor, D};
use candle_nn::{BatchNorm, Conv2d, Dropout, Linear, Module, ModuleT, VarBuilder};

use crate::config::DenseNetConfig;
use crate::init::{self, WeightInit};
use crate::ImageClassifier;

/// Bottleneck layer: norm -> relu -> 1x1 conv -> norm -> relu -> 3x3 conv,
/// producing `growth_rate` new feature maps that are concatenated onto the
/// block input.
struct DenseLayer {
    norm1: BatchNorm,
    conv1: Conv2d,
    norm2: BatchNorm,
    conv2: Conv2d,
    dropout: Dropout,
}

impl DenseLayer {
    fn new(
        num_input_features: usize,
        growth_rate: usize,
        bn_size: usize,
        dropout_rate: f32,
        weight_init: WeightInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bottleneck = bn_size * growth_rate;
        Ok(Self {
            norm1: init::batch_norm(num_input_features, vb.pp("norm1"))?,
            conv1: init::conv2d(
                num_input_features,
                bottleneck,
                1,
                1,
                0,
                false,
                weight_init,
                0.0,
                vb.pp("conv1"),
            )?,
            norm2: init::batch_norm(bottleneck, vb.pp("norm2"))?,
            conv2: init::conv2d(bottleneck, growth_rate, 3, 1, 1, false, weight_init, 0.0, vb.pp("conv2"))?,
            dropout: Dropout::new(dropout_rate),
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.norm1.forward_t(xs, train)?.relu()?;
        let out = self.conv1.forward(&out)?;
        let out = self.norm2.forward_t(&out, train)?.relu()?;
        let out = self.conv2.forward(&out)?;
        let out = self.dropout.forward(&out, train)?;
        Tensor::cat(&[xs, &out], 1)
    }
}

struct DenseBlock {
    layers: Vec<DenseLayer>,
}

impl DenseBlock {
    fn new(
        num_layers: usize,
        num_input_features: usize,
        growth_rate: usize,
        bn_size: usize,
        dropout_rate: f32,
        weight_init: WeightInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            layers.push(DenseLayer::new(
                num_input_features + i * growth_rate,
                growth_rate,
                bn_size,
                dropout_rate,
                weight_init,
                vb.pp(format!("denselayer{}", i + 1)),
            )?);
        }
        Ok(Self { layers })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = xs.clone();
        for layer in &self.layers {
            out = layer.forward_t(&out, train)?;
        }
        Ok(out)
    }
}

/// Channel-halving transition between dense blocks.
struct Transition {
    norm: BatchNorm,
    conv: Conv2d,
}

impl Transition {
    fn new(
        num_input_features: usize,
        num_output_features: usize,
        weight_init: WeightInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            norm: init::batch_norm(num_input_features, vb.pp("norm"))?,
            conv: init::conv2d(
                num_input_features,
                num_output_features,
                1,
                1,
                0,
                false,
                weight_init,
                0.0,
                vb.pp("conv"),
            )?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.norm.forward_t(xs, train)?.relu()?;
        let out = self.conv.forward(&out)?;
        out.avg_pool2d(2)
    }
}

enum Stem {
    /// 3x3 stride-1 convolution for 32x32-class inputs.
    Small(Conv2d),
    /// 7x7 stride-2 convolution followed by norm, relu and 3x3 max-pool.
    Large {
        conv: Conv2d,
        norm: BatchNorm,
    },
}

pub struct DenseNet {
    stem: Stem,
    blocks: Vec<(DenseBlock, Option<Transition>)>,
    final_norm: BatchNorm,
    classifier: Linear,
}

impl DenseNet {
    pub fn new(cfg: &DenseNetConfig, weight_init: WeightInit, vb: VarBuilder) -> Result<Self> {
        let features = vb.pp("features");

        let stem = if cfg.small_inputs {
            Stem::Small(init::conv2d(
                3,
                cfg.num_init_features,
                3,
                1,
                1,
                false,
                weight_init,
                0.0,
                features.pp("conv0"),
            )?)
        } else {
            Stem::Large {
                conv: init::conv2d(
                    3,
                    cfg.num_init_features,
                    7,
                    2,
                    3,
                    false,
                    weight_init,
                    0.0,
                    features.pp("conv0"),
                )?,
                norm: init::batch_norm(cfg.num_init_features, features.pp("norm0"))?,
            }
        };

        let mut blocks = Vec::with_capacity(cfg.block_config.len());
        let mut num_features = cfg.num_init_features;
        for (i, &num_layers) in cfg.block_config.iter().enumerate() {
            let block = DenseBlock::new(
                num_layers,
                num_features,
                cfg.growth_rate,
                cfg.bn_size,
                cfg.dropout_rate,
                weight_init,
                features.pp(format!("denseblock{}", i + 1)),
            )?;
            num_features += num_layers * cfg.growth_rate;
            let transition = if i != cfg.block_config.len() - 1 {
                let trans = Transition::new(
                    num_features,
                    num_features / 2,
                    weight_init,
                    features.pp(format!("transition{}", i + 1)),
                )?;
                num_features /= 2;
                Some(trans)
            } else {
                None
            };
            blocks.push((block, transition));
        }

        Ok(Self {
            stem,
            blocks,
            final_norm: init::batch_norm(num_features, features.pp("norm5"))?,
            classifier: init::linear(num_features, cfg.num_classes, weight_init, vb.pp("classifier"))?,
        })
    }
}

impl ImageClassifier for DenseNet {
    fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = match &self.stem {
            Stem::Small(conv) => conv.forward(images)?,
            Stem::Large { conv, norm } => {
                let out = conv.forward(images)?;
                let out = norm.forward_t(&out, train)?.relu()?;
                // 3x3 max-pool with stride 2; pad by one pixel on each side first.
                let out = out.pad_with_zeros(D::Minus1, 1, 1)?;
                let out = out.pad_with_zeros(D::Minus2, 1, 1)?;
                out.max_pool2d_with_stride(3, 2)?
            }
        };
        for (block, transition) in &self.blocks {
            out = block.forward_t(&out, train)?;
            if let Some(transition) = transition {
                out = transition.forward_t(&out, train)?;
            }
        }
        let out = self.final_norm.forward_t(&out, train)?.relu()?;
        let pooled = init::global_avg_pool(&out)?;
        self.classifier.forward(&pooled)
    }
}
