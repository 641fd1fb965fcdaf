use candle_core::{Result, Tensor};
use candle_nn::init::Init;
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear, VarBuilder};
use serde::Deserialize;

/// Named initialization rule applied when a network is constructed.
///
/// The rule is resolved into a concrete `candle_nn::Init` per layer kind
/// (convolution, batch-norm, linear) before any parameter is created; there
/// is no runtime inspection of layer names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeightInit {
    /// Each architecture's published init: kaiming-normal convolutions,
    /// fan-in uniform linear layers.
    #[default]
    Default,
    Xavier,
    Kaiming,
}

impl WeightInit {
    fn conv_weight(self, fan_in: usize, fan_out: usize, negative_slope: f64) -> Init {
        match self {
            WeightInit::Default | WeightInit::Kaiming => kaiming_normal(fan_in, negative_slope),
            WeightInit::Xavier => glorot_uniform(fan_in, fan_out),
        }
    }

    fn linear_weight(self, fan_in: usize, fan_out: usize) -> Init {
        match self {
            WeightInit::Default => fan_in_uniform(fan_in),
            WeightInit::Xavier => glorot_uniform(fan_in, fan_out),
            WeightInit::Kaiming => kaiming_normal(fan_in, 0.0),
        }
    }
}

/// Kaiming-normal with the gain adjusted for the activation's negative
/// slope (0.0 for plain relu).
fn kaiming_normal(fan_in: usize, negative_slope: f64) -> Init {
    let gain = (2.0 / (1.0 + negative_slope * negative_slope)).sqrt();
    Init::Randn {
        mean: 0.0,
        stdev: gain / (fan_in.max(1) as f64).sqrt(),
    }
}

fn glorot_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

fn fan_in_uniform(fan_in: usize) -> Init {
    let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Builds a square convolution with the configured init rule;
/// `negative_slope` is the downstream activation's leak (0.0 for relu) and
/// only shapes the kaiming gain. Biases, when present, start at zero.
#[allow(clippy::too_many_arguments)]
pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    bias: bool,
    init: WeightInit,
    negative_slope: f64,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let fan_in = in_channels * kernel * kernel;
    let fan_out = out_channels * kernel * kernel;
    let weight = vb.get_with_hints(
        (out_channels, in_channels, kernel, kernel),
        "weight",
        init.conv_weight(fan_in, fan_out, negative_slope),
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    let cfg = Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, bias, cfg))
}

/// Builds a linear classifier head; weights follow the init rule, the bias
/// starts at zero as in the reference architectures.
pub fn linear(
    in_features: usize,
    out_features: usize,
    init: WeightInit,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_features, in_features),
        "weight",
        init.linear_weight(in_features, out_features),
    )?;
    let bias = vb.get_with_hints(out_features, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Batch-norm layers always start at gamma = 1, beta = 0 regardless of the
/// configured rule.
pub fn batch_norm(num_features: usize, vb: VarBuilder) -> Result<BatchNorm> {
    batch_norm_with_momentum(num_features, 0.1, vb)
}

/// Batch-norm with an explicit running-statistics momentum, the weight each
/// training batch contributes to the running mean and variance.
pub fn batch_norm_with_momentum(
    num_features: usize,
    momentum: f64,
    vb: VarBuilder,
) -> Result<BatchNorm> {
    let cfg = BatchNormConfig {
        eps: 1e-5,
        remove_mean: true,
        affine: true,
        momentum,
    };
    candle_nn::batch_norm(num_features, cfg, vb)
}

/// Global average pooling over the two trailing spatial dimensions.
pub fn global_avg_pool(xs: &Tensor) -> Result<Tensor> {
    let (_n, _c, _h, _w) = xs.dims4()?;
    xs.mean(3)?.mean(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{ModuleT, VarMap};

    #[test]
    fn leaky_slope_shrinks_the_kaiming_gain() {
        let relu = kaiming_normal(100, 0.0);
        let leaky = kaiming_normal(100, 0.2);
        match (relu, leaky) {
            (Init::Randn { stdev: a, .. }, Init::Randn { stdev: b, .. }) => {
                assert!((a - (2.0f64).sqrt() / 10.0).abs() < 1e-12);
                assert!((b - (2.0f64 / 1.04).sqrt() / 10.0).abs() < 1e-12);
            }
            other => panic!("expected normal inits, got {:?}", other),
        }
    }

    #[test]
    fn batch_norm_momentum_weights_the_current_batch() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let bn = batch_norm_with_momentum(2, 0.9, vb).expect("batch norm");

        // Channel 0 constant at 1.0, channel 1 constant at 3.0.
        let c0 = Tensor::full(1.0f32, (2, 1, 2, 2), &device).expect("c0");
        let c1 = Tensor::full(3.0f32, (2, 1, 2, 2), &device).expect("c1");
        let xs = Tensor::cat(&[&c0, &c1], 1).expect("cat");
        bn.forward_t(&xs, true).expect("forward");

        let running = {
            let data = varmap.data().lock().expect("lock");
            data.get("running_mean")
                .expect("running_mean registered")
                .as_tensor()
                .to_vec1::<f32>()
                .expect("read")
        };
        // Starting from zero, one step leaves momentum * batch_mean.
        assert!((running[0] - 0.9).abs() < 1e-5);
        assert!((running[1] - 2.7).abs() < 1e-5);
    }

    #[test]
    fn xavier_bound_shrinks_with_fan() {
        let narrow = glorot_uniform(8, 8);
        let wide = glorot_uniform(512, 512);
        match (narrow, wide) {
            (Init::Uniform { up: a, .. }, Init::Uniform { up: b, .. }) => assert!(a > b),
            _ => panic!("expected uniform inits"),
        }
    }

    #[test]
    fn default_linear_is_fan_in_uniform() {
        match WeightInit::Default.linear_weight(100, 10) {
            Init::Uniform { lo, up } => {
                assert!((up - 0.1).abs() < 1e-12);
                assert!((lo + 0.1).abs() < 1e-12);
            }
            other => panic!("unexpected init {:?}", other),
        }
    }
}
