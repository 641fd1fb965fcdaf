use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::config::{to_runtime_error, OptimizerKind, TrainingConfig, TrainingError};

#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    Adam(AdamConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub momentum: f64,
    pub nesterov: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl OptimizerConfig {
    /// Main-phase optimizer described by `config`: nesterov SGD or Adam.
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        match config.optimizer {
            OptimizerKind::Sgd => OptimizerConfig::Sgd(SgdConfig {
                learning_rate: config.lr,
                weight_decay: config.wd,
                momentum: config.momentum,
                nesterov: true,
            }),
            OptimizerKind::Adam => OptimizerConfig::Adam(AdamConfig {
                learning_rate: config.lr,
                weight_decay: config.wd,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            }),
        }
    }

    /// Warmup-phase optimizer: fixed `lr / 10` nesterov SGD without weight
    /// decay, matching the main optimizer in nothing else.
    pub fn warmup(config: &TrainingConfig) -> Self {
        OptimizerConfig::Sgd(SgdConfig {
            learning_rate: config.lr / 10.0,
            weight_decay: 0.0,
            momentum: config.momentum,
            nesterov: true,
        })
    }
}

/// Applies gradient updates to a set of named parameters.
///
/// Parameters that received no gradient in a step (batch-norm running
/// statistics, frozen tensors) are skipped.
pub struct ModelOptimizer {
    config: OptimizerConfig,
    slots: Vec<ParameterSlot>,
    step_count: usize,
}

struct ParameterSlot {
    name: String,
    param: Var,
    /// SGD momentum buffer, created lazily on the first gradient.
    momentum: Option<Tensor>,
    /// Adam moment estimates.
    first_moment: Option<Tensor>,
    second_moment: Option<Tensor>,
}

impl ModelOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        let mut slots = Vec::with_capacity(named_parameters.len());
        for (name, param) in named_parameters {
            if !param.as_tensor().dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            slots.push(ParameterSlot {
                name,
                param,
                momentum: None,
                first_moment: None,
                second_moment: None,
            });
        }
        Ok(Self {
            config,
            slots,
            step_count: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::Adam(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::Adam(cfg) => cfg.learning_rate = lr,
        }
    }

    /// Consumes the gradients of one backward pass and updates every
    /// parameter that received one.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.step_count += 1;
        let config = self.config;
        for idx in 0..self.slots.len() {
            let grad = {
                let slot = &self.slots[idx];
                match grads.remove(slot.param.as_tensor()) {
                    Some(grad) => grad,
                    None => continue,
                }
            };
            let grad = grad.to_dtype(DType::F32).map_err(|err| {
                TrainingError::runtime(format!(
                    "gradient for '{}' could not be read: {}",
                    self.slots[idx].name, err
                ))
            })?;
            match config {
                OptimizerConfig::Sgd(cfg) => self.step_sgd(idx, cfg, grad)?,
                OptimizerConfig::Adam(cfg) => self.step_adam(idx, cfg, grad)?,
            }
        }
        Ok(())
    }

    fn step_sgd(&mut self, idx: usize, cfg: SgdConfig, grad: Tensor) -> Result<(), TrainingError> {
        let slot = &mut self.slots[idx];
        let param = slot.param.as_tensor();

        let grad = if cfg.weight_decay != 0.0 {
            let decay = param
                .affine(cfg.weight_decay, 0.0)
                .map_err(to_runtime_error)?;
            grad.add(&decay).map_err(to_runtime_error)?
        } else {
            grad
        };

        let update = if cfg.momentum != 0.0 {
            let buf = match slot.momentum.take() {
                Some(prev) => prev
                    .affine(cfg.momentum, 0.0)
                    .and_then(|scaled| scaled.add(&grad))
                    .map_err(to_runtime_error)?,
                None => grad.clone(),
            };
            let update = if cfg.nesterov {
                buf.affine(cfg.momentum, 0.0)
                    .and_then(|scaled| grad.add(&scaled))
                    .map_err(to_runtime_error)?
            } else {
                buf.clone()
            };
            slot.momentum = Some(buf);
            update
        } else {
            grad
        };

        let next = param
            .sub(&update.affine(cfg.learning_rate, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;
        slot.param.set(&next).map_err(to_runtime_error)
    }

    fn step_adam(&mut self, idx: usize, cfg: AdamConfig, grad: Tensor) -> Result<(), TrainingError> {
        let step = self.step_count as i32;
        let slot = &mut self.slots[idx];
        let param = slot.param.as_tensor();

        let grad = if cfg.weight_decay != 0.0 {
            let decay = param
                .affine(cfg.weight_decay, 0.0)
                .map_err(to_runtime_error)?;
            grad.add(&decay).map_err(to_runtime_error)?
        } else {
            grad
        };

        let zeros = || Tensor::zeros_like(&grad);
        let prev_m = match slot.first_moment.take() {
            Some(m) => m,
            None => zeros().map_err(to_runtime_error)?,
        };
        let prev_v = match slot.second_moment.take() {
            Some(v) => v,
            None => zeros().map_err(to_runtime_error)?,
        };

        let new_m = prev_m
            .affine(cfg.beta1, 0.0)
            .and_then(|m| m.add(&grad.affine(1.0 - cfg.beta1, 0.0)?))
            .map_err(to_runtime_error)?;
        let new_v = prev_v
            .affine(cfg.beta2, 0.0)
            .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?))
            .map_err(to_runtime_error)?;

        let bias1 = 1.0 - cfg.beta1.powi(step);
        let bias2 = 1.0 - cfg.beta2.powi(step);
        let update = new_m
            .affine(1.0 / bias1, 0.0)
            .and_then(|m_hat| {
                let denom = new_v
                    .affine(1.0 / bias2, 0.0)?
                    .sqrt()?
                    .affine(1.0, cfg.epsilon)?;
                m_hat.div(&denom)
            })
            .and_then(|d| d.affine(cfg.learning_rate, 0.0))
            .map_err(to_runtime_error)?;

        let next = param.sub(&update).map_err(to_runtime_error)?;
        slot.param.set(&next).map_err(to_runtime_error)?;
        slot.first_moment = Some(new_m);
        slot.second_moment = Some(new_v);
        Ok(())
    }
}

/// Snapshot of a `VarMap`'s contents in a deterministic order.
pub fn named_parameters(varmap: &candle_nn::VarMap) -> Vec<(String, Var)> {
    let data = varmap.data().lock().expect("varmap lock poisoned");
    let mut named: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named
}
