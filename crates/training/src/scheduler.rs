use crate::config::{SchedulerKind, TrainingConfig, TrainingError};

/// Epoch-driven learning-rate schedule. `step` is called once per epoch with
/// that epoch's validation error; schedules that do not watch the metric
/// advance unconditionally.
pub trait LrSchedule: Send {
    fn step(&mut self, valid_error: f64) -> f64;
    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    ReduceOnPlateau {
        base_lr: f64,
        patience: usize,
    },
    MultiStep {
        base_lr: f64,
        milestones: Vec<f64>,
        gamma: f64,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        let base_lr = config.lr;
        match config.lr_scheduler {
            SchedulerKind::ReduceOnPlateau => SchedulerConfig::ReduceOnPlateau {
                base_lr,
                patience: 20,
            },
            SchedulerKind::MultiStep150 => SchedulerConfig::MultiStep {
                base_lr,
                milestones: vec![150.0, 225.0, 300.0],
                gamma: 0.1,
            },
            SchedulerKind::MultiStep60 => SchedulerConfig::MultiStep {
                base_lr,
                milestones: vec![60.0, 120.0, 160.0, 200.0],
                gamma: 0.2,
            },
            SchedulerKind::Halfway => SchedulerConfig::MultiStep {
                base_lr,
                milestones: vec![
                    0.5 * config.n_epochs as f64,
                    0.75 * config.n_epochs as f64,
                ],
                gamma: 0.1,
            },
        }
    }

    pub fn build(self) -> Result<Box<dyn LrSchedule>, TrainingError> {
        match self {
            SchedulerConfig::ReduceOnPlateau { base_lr, patience } => {
                Ok(Box::new(ReduceOnPlateau::new(base_lr, patience)?))
            }
            SchedulerConfig::MultiStep {
                base_lr,
                milestones,
                gamma,
            } => Ok(Box::new(MultiStep::new(base_lr, milestones, gamma)?)),
        }
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without
/// a meaningful improvement of the validation error.
struct ReduceOnPlateau {
    current_lr: f64,
    patience: usize,
    factor: f64,
    threshold: f64,
    best: Option<f64>,
    bad_epochs: usize,
}

impl ReduceOnPlateau {
    fn new(base_lr: f64, patience: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        Ok(Self {
            current_lr: base_lr,
            patience,
            factor: 0.1,
            threshold: 1e-4,
            best: None,
            bad_epochs: 0,
        })
    }

    fn improved(&self, valid_error: f64) -> bool {
        match self.best {
            None => true,
            Some(best) => valid_error < best * (1.0 - self.threshold),
        }
    }
}

impl LrSchedule for ReduceOnPlateau {
    fn step(&mut self, valid_error: f64) -> f64 {
        if self.improved(valid_error) {
            self.best = Some(valid_error);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
            if self.bad_epochs > self.patience {
                self.current_lr *= self.factor;
                self.bad_epochs = 0;
            }
        }
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

/// Decays the learning rate by `gamma` at every configured epoch milestone.
struct MultiStep {
    base_lr: f64,
    milestones: Vec<f64>,
    gamma: f64,
    epoch: usize,
    current_lr: f64,
}

impl MultiStep {
    fn new(base_lr: f64, milestones: Vec<f64>, gamma: f64) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if !(0.0..1.0).contains(&gamma) {
            return Err(TrainingError::initialization(
                "scheduler gamma must be in (0, 1)",
            ));
        }
        Ok(Self {
            base_lr,
            milestones,
            gamma,
            epoch: 0,
            current_lr: base_lr,
        })
    }
}

impl LrSchedule for MultiStep {
    fn step(&mut self, _valid_error: f64) -> f64 {
        self.epoch += 1;
        let passed = self
            .milestones
            .iter()
            .filter(|&&m| (self.epoch as f64) >= m)
            .count();
        self.current_lr = self.base_lr * self.gamma.powi(passed as i32);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}
