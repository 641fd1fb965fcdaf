use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

use crate::config::LossKind;

const MARGIN: f64 = 1.0;

/// Batch loss over class logits `[N, C]` and integer targets `[N]`.
#[derive(Debug, Clone, Copy)]
pub enum Criterion {
    CrossEntropy,
    /// Multi-class margin loss; exactly zero when every target logit beats
    /// every other logit by the margin.
    Margin,
}

impl From<LossKind> for Criterion {
    fn from(kind: LossKind) -> Self {
        match kind {
            LossKind::CrossEntropy => Criterion::CrossEntropy,
            LossKind::Margin => Criterion::Margin,
        }
    }
}

impl Criterion {
    /// Returns the scalar loss tensor, averaged over the batch.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        match self {
            Criterion::CrossEntropy => cross_entropy(logits, targets),
            Criterion::Margin => multi_margin(logits, targets),
        }
    }
}

/// Mean negative log-likelihood of the log-softmax distribution.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (batch, _classes) = logits.dims2()?;
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let targets = targets.to_dtype(DType::U32)?;
    let picked = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?;
    picked.neg()?.sum_all()?.affine(1.0 / batch as f64, 0.0)
}

fn multi_margin(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (batch, classes) = logits.dims2()?;
    let targets = targets.to_dtype(DType::U32)?;
    let target_scores = logits.gather(&targets.unsqueeze(1)?, 1)?;
    // hinge_j = max(0, margin - x_y + x_j); the j = y term contributes
    // exactly `margin`, removed from the sum below.
    let hinges = logits
        .broadcast_sub(&target_scores)?
        .affine(1.0, MARGIN)?
        .relu()?;
    let per_sample = hinges
        .sum(D::Minus1)?
        .affine(1.0, -MARGIN)?
        .affine(1.0 / classes as f64, 0.0)?;
    per_sample.sum_all()?.affine(1.0 / batch as f64, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_vec0::<f32>().expect("scalar")
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_classes() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((4, 10), DType::F32, &device).expect("logits");
        let targets = Tensor::zeros(4, DType::U32, &device).expect("targets");
        let loss = Criterion::CrossEntropy
            .compute(&logits, &targets)
            .expect("loss");
        assert!((scalar(&loss) - (10f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn margin_loss_is_zero_on_confident_batches() {
        let device = Device::Cpu;
        // Target logit beats every other logit by more than the margin.
        let logits = Tensor::new(&[[5.0f32, 0.0, 0.0], [0.0, 5.0, 0.0]], &device).expect("logits");
        let targets = Tensor::new(&[0u32, 1], &device).expect("targets");
        let loss = Criterion::Margin.compute(&logits, &targets).expect("loss");
        assert_eq!(scalar(&loss), 0.0);
    }

    #[test]
    fn margin_loss_penalizes_violations() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.0f32, 0.0, 0.0]], &device).expect("logits");
        let targets = Tensor::new(&[0u32], &device).expect("targets");
        let loss = Criterion::Margin.compute(&logits, &targets).expect("loss");
        // Two non-target classes each violate by the full margin: 2/3.
        assert!((scalar(&loss) - 2.0 / 3.0).abs() < 1e-6);
    }
}
