use std::time::Instant;

use candle_core::{DType, Tensor, D};
use model::ImageClassifier;

use crate::config::{to_runtime_error, TrainingError};
use crate::data::TensorBatches;
use crate::loss::Criterion;
use crate::meter::Meter;
use crate::optimizer::ModelOptimizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochMode {
    Train,
    Eval,
}

impl EpochMode {
    fn label(self) -> &'static str {
        match self {
            EpochMode::Train => "Train",
            EpochMode::Eval => "Eval",
        }
    }
}

/// Finalized meter readings of one pass over a loader.
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    /// Summed wall-clock seconds across batches.
    pub time: f64,
    /// Mean loss per batch.
    pub loss: f64,
    /// Mean top-1 error per batch.
    pub error: f64,
}

/// Everything one epoch pass needs; bundled so the two runner variants share
/// a signature.
pub struct EpochRun<'a> {
    pub loader: &'a TensorBatches,
    pub model: &'a dyn ImageClassifier,
    pub criterion: Criterion,
    pub optimizer: &'a mut ModelOptimizer,
    pub mode: EpochMode,
    pub epoch: usize,
    pub n_epochs: usize,
    pub log_every_step: bool,
}

/// Standard epoch pass: every training batch takes a backward pass and one
/// optimizer step.
pub fn run_epoch(run: EpochRun<'_>) -> Result<EpochStats, TrainingError> {
    run_epoch_inner(run, false)
}

/// Fast variant: skips the backward/optimizer step when the batch loss is
/// not strictly positive, which leaves the model untouched on batches the
/// margin loss already scores as solved.
pub fn run_epoch_fast(run: EpochRun<'_>) -> Result<EpochStats, TrainingError> {
    run_epoch_inner(run, true)
}

fn run_epoch_inner(
    run: EpochRun<'_>,
    skip_nonpositive_loss: bool,
) -> Result<EpochStats, TrainingError> {
    let mut time_meter = Meter::new("Time", true);
    let mut loss_meter = Meter::new("Loss", false);
    let mut error_meter = Meter::new("Error", false);

    match run.mode {
        EpochMode::Train => println!("Training"),
        EpochMode::Eval => println!("Evaluating"),
    }

    let num_batches = run.loader.len();
    let mut end = Instant::now();
    for (i, batch) in run.loader.iter().enumerate() {
        let (images, targets) = batch?;

        let (loss_value, logits) = match run.mode {
            EpochMode::Train => {
                let logits = run
                    .model
                    .forward_t(&images, true)
                    .map_err(to_runtime_error)?;
                let loss = run
                    .criterion
                    .compute(&logits, &targets)
                    .map_err(to_runtime_error)?;
                let loss_value = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;
                if !(skip_nonpositive_loss && loss_value <= 0.0) {
                    let mut grads = loss.backward().map_err(to_runtime_error)?;
                    run.optimizer.step(&mut grads)?;
                }
                (loss_value, logits.detach())
            }
            EpochMode::Eval => {
                // No backward pass; detaching drops the autodiff graph.
                let logits = run
                    .model
                    .forward_t(&images, false)
                    .map_err(to_runtime_error)?
                    .detach();
                let loss = run
                    .criterion
                    .compute(&logits, &targets)
                    .map_err(to_runtime_error)?;
                let loss_value = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;
                (loss_value, logits)
            }
        };

        let error = top1_error(&logits, &targets)?;
        let batch_time = end.elapsed().as_secs_f64();
        end = Instant::now();

        time_meter.update(batch_time);
        loss_meter.update(loss_value);
        error_meter.update(error);

        if run.log_every_step {
            println!(
                "{}: (Epoch {} of {}) [{:04}/{:04}]  {}  {}  {}  {:.4}",
                run.mode.label(),
                run.epoch,
                run.n_epochs,
                i + 1,
                num_batches,
                time_meter,
                loss_meter,
                error_meter,
                run.optimizer.learning_rate(),
            );
        }
    }

    if !run.log_every_step {
        println!(
            "{}: (Epoch {} of {})  {}  {}  {}",
            run.mode.label(),
            run.epoch,
            run.n_epochs,
            time_meter,
            loss_meter,
            error_meter,
        );
    }

    Ok(EpochStats {
        time: time_meter.value(),
        loss: loss_meter.value(),
        error: error_meter.value(),
    })
}

/// `1 - (fraction of the batch where argmax(logits) == target)`.
pub fn top1_error(logits: &Tensor, targets: &Tensor) -> Result<f64, TrainingError> {
    let accuracy = logits
        .argmax(D::Minus1)
        .and_then(|predictions| predictions.eq(&targets.to_dtype(DType::U32)?))
        .and_then(|correct| correct.to_dtype(DType::F32))
        .and_then(|correct| correct.mean_all())
        .and_then(|mean| mean.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(1.0 - accuracy as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn perfect_predictions_have_zero_error() {
        let device = Device::Cpu;
        let logits =
            Tensor::new(&[[9.0f32, 0.0, 0.0], [0.0, 9.0, 0.0], [0.0, 0.0, 9.0]], &device)
                .expect("logits");
        let targets = Tensor::new(&[0u32, 1, 2], &device).expect("targets");
        assert_eq!(top1_error(&logits, &targets).expect("error"), 0.0);
    }

    #[test]
    fn all_wrong_predictions_have_full_error() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[9.0f32, 0.0], [0.0, 9.0]], &device).expect("logits");
        let targets = Tensor::new(&[1u32, 0], &device).expect("targets");
        assert_eq!(top1_error(&logits, &targets).expect("error"), 1.0);
    }

    #[test]
    fn mixed_batch_averages_per_sample() {
        let device = Device::Cpu;
        let logits =
            Tensor::new(&[[9.0f32, 0.0], [9.0, 0.0], [0.0, 9.0], [9.0, 0.0]], &device)
                .expect("logits");
        let targets = Tensor::new(&[0u32, 1, 1, 0], &device).expect("targets");
        let error = top1_error(&logits, &targets).expect("error");
        assert!((error - 0.25).abs() < 1e-6);
    }
}
