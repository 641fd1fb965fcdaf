use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use model::WeightInit;
use serde::Deserialize;

/// Training hyperparameters, the deserialized form of `cfg/trn_para`.
///
/// Every optional field carries an explicit default so that downstream code
/// never branches on key presence; `validate` is the single place where the
/// values are checked.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    pub n_epochs: usize,
    pub lr: f64,
    #[serde(default)]
    pub wd: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    #[serde(default)]
    pub lr_scheduler: SchedulerKind,
    #[serde(default)]
    pub loss_fn: LossKind,
    #[serde(default)]
    pub warmup: usize,
    #[serde(default)]
    pub weight_init: WeightInit,
    #[serde(default)]
    pub run_epoch: EpochVariant,
    #[serde(default = "default_true")]
    pub log_every_step: bool,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Safetensors dataset consumed by the CLI; library callers provide
    /// loaders directly.
    #[serde(default)]
    pub data_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum OptimizerKind {
    #[default]
    #[serde(rename = "SGD")]
    Sgd,
    Adam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum SchedulerKind {
    #[serde(rename = "ReduceLROnPlateau")]
    ReduceOnPlateau,
    #[serde(rename = "MultiStepLR_150_225_300")]
    MultiStep150,
    #[serde(rename = "MultiStepLR_60_120_160_200")]
    MultiStep60,
    /// Step decay at 50% and 75% of `n_epochs`.
    #[default]
    #[serde(rename = "default")]
    Halfway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum LossKind {
    #[serde(rename = "MarginLoss")]
    Margin,
    #[default]
    #[serde(rename = "CrossEntropy")]
    CrossEntropy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EpochVariant {
    #[default]
    Standard,
    /// Skips the backward/optimizer step when the batch loss is not
    /// strictly positive.
    Fast,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.lr <= 0.0 {
            errors.push("lr must be greater than 0".to_string());
        }
        if self.wd < 0.0 {
            errors.push("wd must be >= 0".to_string());
        }
        if !(0.0..1.0).contains(&self.momentum) {
            errors.push("momentum must be in [0, 1)".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::Validation(errors))
        }
    }
}

fn default_momentum() -> f64 {
    0.9
}

fn default_batch_size() -> usize {
    64
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "run failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
