use serde::Deserialize;

/// Architecture selection record, the deserialized form of `cfg/net_arch`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum NetArch {
    #[serde(alias = "densenet_bc")]
    DenseNet(DenseNetConfig),
    #[serde(alias = "wide_resnet28_10", alias = "wide_resnet28_12", alias = "wide_resnet40_2")]
    WideResNet(WideResNetConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DenseNetConfig {
    /// Features added by every dense layer (`k` in the paper).
    #[serde(default = "default_growth_rate")]
    pub growth_rate: usize,
    /// Layers per dense block.
    #[serde(default = "default_block_config")]
    pub block_config: Vec<usize>,
    /// Filters learned by the stem convolution.
    #[serde(default = "default_init_features")]
    pub num_init_features: usize,
    /// Bottleneck width multiplier (`bn_size * k` features in the 1x1 conv).
    #[serde(default = "default_bn_size")]
    pub bn_size: usize,
    #[serde(default)]
    pub dropout_rate: f32,
    pub num_classes: usize,
    /// CIFAR-style 3x3 stem; `false` selects the ImageNet 7x7 stem with
    /// norm/relu/max-pool.
    #[serde(default = "default_true")]
    pub small_inputs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WideResNetConfig {
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_widen_factor")]
    pub widen_factor: usize,
    #[serde(default)]
    pub dropout_rate: f32,
    pub num_classes: usize,
    /// Leaky-relu (slope 0.2) variant.
    #[serde(default)]
    pub leak: bool,
}

impl NetArch {
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        match self {
            NetArch::DenseNet(cfg) => {
                if cfg.growth_rate == 0 {
                    errors.push("densenet growth_rate must be greater than 0".to_string());
                }
                if cfg.block_config.is_empty() || cfg.block_config.iter().any(|&n| n == 0) {
                    errors.push("densenet block_config entries must be non-empty and > 0".to_string());
                }
                if cfg.num_init_features == 0 {
                    errors.push("densenet num_init_features must be greater than 0".to_string());
                }
                if cfg.num_classes == 0 {
                    errors.push("densenet num_classes must be greater than 0".to_string());
                }
                if !(0.0..1.0).contains(&cfg.dropout_rate) {
                    errors.push("densenet dropout_rate must be in [0, 1)".to_string());
                }
            }
            NetArch::WideResNet(cfg) => {
                if cfg.depth < 10 || (cfg.depth - 4) % 6 != 0 {
                    errors.push("wide-resnet depth must be of the form 6n+4".to_string());
                }
                if cfg.widen_factor == 0 {
                    errors.push("wide-resnet widen_factor must be greater than 0".to_string());
                }
                if cfg.num_classes == 0 {
                    errors.push("wide-resnet num_classes must be greater than 0".to_string());
                }
                if !(0.0..1.0).contains(&cfg.dropout_rate) {
                    errors.push("wide-resnet dropout_rate must be in [0, 1)".to_string());
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

fn default_growth_rate() -> usize {
    12
}

fn default_block_config() -> Vec<usize> {
    vec![6, 6, 6]
}

fn default_init_features() -> usize {
    24
}

fn default_bn_size() -> usize {
    4
}

fn default_depth() -> usize {
    28
}

fn default_widen_factor() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn densenet_defaults_deserialize() {
        let arch: NetArch =
            toml::from_str("model = \"dense_net\"\nnum_classes = 100\n").expect("parse");
        match arch {
            NetArch::DenseNet(cfg) => {
                assert_eq!(cfg.growth_rate, 12);
                assert_eq!(cfg.block_config, vec![6, 6, 6]);
                assert!(cfg.small_inputs);
            }
            other => panic!("unexpected arch {:?}", other),
        }
    }

    #[test]
    fn wide_resnet_depth_validated() {
        let arch = NetArch::WideResNet(WideResNetConfig {
            depth: 27,
            widen_factor: 10,
            dropout_rate: 0.0,
            num_classes: 10,
            leak: false,
        });
        assert!(arch.validate().is_err());
    }

    #[test]
    fn wide_resnet_valid_depths_pass() {
        for depth in [10, 16, 22, 28, 40] {
            let arch = NetArch::WideResNet(WideResNetConfig {
                depth,
                widen_factor: 2,
                dropout_rate: 0.0,
                num_classes: 10,
                leak: false,
            });
            assert!(arch.validate().is_ok(), "depth {} should validate", depth);
        }
    }
}
