use std::path::Path;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{Init, VarBuilder, VarMap};
use model::{get_model, ImageClassifier, NetArch, WeightInit};

use crate::checkpoint;
use crate::config::{to_runtime_error, TrainingError};
use crate::data::ImageDataset;
use crate::loss::Criterion;

const ECE_BINS: usize = 15;
const MAX_FIT_ITERS: usize = 50;
const GRAD_TOL: f64 = 1e-7;
const STEP_TOL: f64 = 1e-9;
const ARMIJO_C1: f64 = 1e-4;
const MIN_TEMPERATURE: f64 = 1e-3;

/// A trained classifier with a single learned scalar that divides its
/// logits before softmax. The temperature reshapes the confidence of the
/// predictions without changing their ranking.
pub struct ModelWithTemperature {
    model: Box<dyn ImageClassifier>,
    temperature: Var,
}

impl ModelWithTemperature {
    pub fn new(model: Box<dyn ImageClassifier>, temperature: Var) -> Self {
        Self { model, temperature }
    }

    pub fn temperature(&self) -> Result<f64, TrainingError> {
        let value = self
            .temperature
            .as_tensor()
            .to_scalar::<f32>()
            .map_err(to_runtime_error)?;
        Ok(f64::from(value))
    }

    pub fn set_temperature(&self, value: f64) -> Result<(), TrainingError> {
        let tensor = Tensor::new(value as f32, self.temperature.device())
            .map_err(to_runtime_error)?;
        self.temperature.set(&tensor).map_err(to_runtime_error)
    }

    /// Divides raw logits by the current temperature.
    pub fn scale(&self, logits: &Tensor) -> candle_core::Result<Tensor> {
        logits.broadcast_div(self.temperature.as_tensor())
    }
}

impl ImageClassifier for ModelWithTemperature {
    fn forward_t(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let logits = self.model.forward_t(images, train)?;
        self.scale(&logits)
    }
}

/// Loads the best snapshot from `save_dir`, fits a temperature on the
/// validation split and writes the calibrated parameters back next to the
/// original snapshot.
pub fn calibrate(
    dataset: &ImageDataset,
    arch: &NetArch,
    save_dir: &Path,
    device: &Device,
    model_filename: &str,
    calibrated_filename: &str,
) -> Result<(), TrainingError> {
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = get_model(arch, WeightInit::Default, vb.clone()).map_err(|err| {
        TrainingError::initialization(format!("failed to build model: {}", err))
    })?;
    checkpoint::load_parameters(&mut varmap, &save_dir.join(model_filename))?;

    // Created after the load so the snapshot is not expected to contain it.
    vb.get_with_hints((), "temperature", Init::Const(1.0))
        .map_err(to_runtime_error)?;
    let temperature = find_var(&varmap, "temperature").ok_or_else(|| {
        TrainingError::initialization("temperature variable missing from var map")
    })?;
    let wrapped = ModelWithTemperature::new(model, temperature);

    let (logits, labels) = collect_logits(&wrapped, dataset)?;

    let nll_before = negative_log_likelihood(&logits, &labels, 1.0)?;
    let ece_before = expected_calibration_error(&logits, &labels, 1.0, ECE_BINS)?;
    println!(
        "Before temperature - NLL: {:.4}, ECE: {:.4}",
        nll_before, ece_before
    );

    let fitted = fit_temperature(&logits, &labels)?;
    wrapped.set_temperature(fitted)?;
    println!("Optimal temperature: {:.4}", fitted);

    let nll_after = negative_log_likelihood(&logits, &labels, fitted)?;
    let ece_after = expected_calibration_error(&logits, &labels, fitted, ECE_BINS)?;
    println!(
        "After temperature - NLL: {:.4}, ECE: {:.4}",
        nll_after, ece_after
    );

    let calibrated_path = save_dir.join(calibrated_filename);
    checkpoint::save_parameters(&varmap, &calibrated_path)?;
    println!(
        "Temperature scaled model saved to {}",
        calibrated_path.display()
    );
    Ok(())
}

fn find_var(varmap: &VarMap, name: &str) -> Option<Var> {
    let data = varmap.data().lock().expect("varmap lock poisoned");
    data.get(name).cloned()
}

/// Runs the whole validation split through the raw model once and keeps the
/// detached logits so the fit never touches the network again.
fn collect_logits(
    wrapped: &ModelWithTemperature,
    dataset: &ImageDataset,
) -> Result<(Tensor, Tensor), TrainingError> {
    let mut logit_chunks = Vec::with_capacity(dataset.valid.len());
    let mut label_chunks = Vec::with_capacity(dataset.valid.len());
    for batch in dataset.valid.iter() {
        let (images, labels) = batch?;
        let logits = wrapped
            .model
            .forward_t(&images, false)
            .and_then(|l| l.detach().contiguous())
            .map_err(to_runtime_error)?;
        logit_chunks.push(logits);
        label_chunks.push(labels);
    }
    if logit_chunks.is_empty() {
        return Err(TrainingError::runtime(
            "validation split is empty, nothing to calibrate on",
        ));
    }
    let logits = Tensor::cat(&logit_chunks, 0).map_err(to_runtime_error)?;
    let labels = Tensor::cat(&label_chunks, 0).map_err(to_runtime_error)?;
    Ok((logits, labels))
}

/// Mean cross entropy of the logits divided by `temperature`.
fn negative_log_likelihood(
    logits: &Tensor,
    labels: &Tensor,
    temperature: f64,
) -> Result<f64, TrainingError> {
    let scalar = Tensor::new(temperature as f32, logits.device()).map_err(to_runtime_error)?;
    let scaled = logits.broadcast_div(&scalar).map_err(to_runtime_error)?;
    let loss = Criterion::CrossEntropy
        .compute(&scaled, labels)
        .map_err(to_runtime_error)?;
    let value = loss.to_scalar::<f32>().map_err(to_runtime_error)?;
    Ok(f64::from(value))
}

/// Equal-width binning of the confidences; the score is the weighted mean
/// gap between per-bin confidence and per-bin accuracy.
pub fn expected_calibration_error(
    logits: &Tensor,
    labels: &Tensor,
    temperature: f64,
    n_bins: usize,
) -> Result<f64, TrainingError> {
    let scalar = Tensor::new(temperature as f32, logits.device()).map_err(to_runtime_error)?;
    let scaled = logits.broadcast_div(&scalar).map_err(to_runtime_error)?;
    let probs = candle_nn::ops::softmax(&scaled, D::Minus1).map_err(to_runtime_error)?;
    let probs = probs.to_vec2::<f32>().map_err(to_runtime_error)?;
    let labels = labels
        .to_dtype(DType::U32)
        .and_then(|l| l.to_vec1::<u32>())
        .map_err(to_runtime_error)?;

    let mut bin_confidence = vec![0.0f64; n_bins];
    let mut bin_correct = vec![0.0f64; n_bins];
    let mut bin_count = vec![0usize; n_bins];
    for (row, label) in probs.iter().zip(labels.iter()) {
        let mut predicted = 0usize;
        let mut confidence = f32::MIN;
        for (class, &p) in row.iter().enumerate() {
            if p > confidence {
                confidence = p;
                predicted = class;
            }
        }
        let confidence = f64::from(confidence);
        let bin = ((confidence * n_bins as f64).ceil() as usize)
            .saturating_sub(1)
            .min(n_bins - 1);
        bin_confidence[bin] += confidence;
        if predicted as u32 == *label {
            bin_correct[bin] += 1.0;
        }
        bin_count[bin] += 1;
    }

    let total = probs.len() as f64;
    let mut ece = 0.0;
    for bin in 0..n_bins {
        if bin_count[bin] == 0 {
            continue;
        }
        let count = bin_count[bin] as f64;
        let accuracy = bin_correct[bin] / count;
        let confidence = bin_confidence[bin] / count;
        ece += (count / total) * (accuracy - confidence).abs();
    }
    Ok(ece)
}

/// One-dimensional quasi-Newton minimization of the scaled cross entropy.
///
/// The curvature is estimated from successive gradients (a secant step) and
/// each move is shrunk by backtracking until it satisfies a sufficient
/// decrease condition.
pub fn fit_temperature(logits: &Tensor, labels: &Tensor) -> Result<f64, TrainingError> {
    let mut t = 1.0f64;
    let (mut value, mut grad) = nll_and_grad(logits, labels, t)?;
    let mut previous: Option<(f64, f64)> = None;

    for _ in 0..MAX_FIT_ITERS {
        if grad.abs() < GRAD_TOL {
            break;
        }

        let direction = match previous {
            Some((prev_t, prev_grad)) => {
                let curvature = (grad - prev_grad) / (t - prev_t);
                if curvature > 0.0 {
                    -grad / curvature
                } else {
                    -grad
                }
            }
            None => -grad,
        };

        let mut step = 1.0f64;
        let mut next_t = t;
        let mut next_value = value;
        let mut accepted = false;
        for _ in 0..30 {
            let candidate = (t + step * direction).max(MIN_TEMPERATURE);
            let candidate_value = negative_log_likelihood(logits, labels, candidate)?;
            if candidate_value <= value + ARMIJO_C1 * step * grad * direction {
                next_t = candidate;
                next_value = candidate_value;
                accepted = true;
                break;
            }
            step *= 0.5;
        }
        if !accepted || (next_t - t).abs() < STEP_TOL {
            break;
        }

        previous = Some((t, grad));
        t = next_t;
        value = next_value;
        let (_, next_grad) = nll_and_grad(logits, labels, t)?;
        grad = next_grad;
    }

    Ok(t)
}

fn nll_and_grad(logits: &Tensor, labels: &Tensor, t: f64) -> Result<(f64, f64), TrainingError> {
    let temperature = Var::from_tensor(
        &Tensor::new(t as f32, logits.device()).map_err(to_runtime_error)?,
    )
    .map_err(to_runtime_error)?;
    let scaled = logits
        .broadcast_div(temperature.as_tensor())
        .map_err(to_runtime_error)?;
    let loss = Criterion::CrossEntropy
        .compute(&scaled, labels)
        .map_err(to_runtime_error)?;
    let grads = loss.backward().map_err(to_runtime_error)?;
    let grad = grads
        .get(temperature.as_tensor())
        .ok_or_else(|| TrainingError::runtime("temperature gradient missing"))?
        .to_scalar::<f32>()
        .map_err(to_runtime_error)?;
    let value = loss.to_scalar::<f32>().map_err(to_runtime_error)?;
    Ok((f64::from(value), f64::from(grad)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    // Confident logits whose argmax matches the label; dividing by a large
    // temperature can only raise the loss, so the fit stays near the left
    // clamp or 1.0 without ever increasing the NLL.
    fn confident_batch() -> (Tensor, Tensor) {
        let logits = Tensor::new(
            &[[6.0f32, 0.0, 0.0], [0.0, 6.0, 0.0], [0.0, 0.0, 6.0], [6.0, 0.0, 0.0]],
            &device(),
        )
        .unwrap();
        let labels = Tensor::new(&[0u32, 1, 2, 0], &device()).unwrap();
        (logits, labels)
    }

    #[test]
    fn fit_never_increases_nll() {
        let (logits, labels) = confident_batch();
        let before = negative_log_likelihood(&logits, &labels, 1.0).unwrap();
        let fitted = fit_temperature(&logits, &labels).unwrap();
        let after = negative_log_likelihood(&logits, &labels, fitted).unwrap();
        assert!(after <= before + 1e-6, "nll rose from {} to {}", before, after);
        assert!(fitted >= MIN_TEMPERATURE);
    }

    #[test]
    fn fit_is_deterministic() {
        let (logits, labels) = confident_batch();
        let first = fit_temperature(&logits, &labels).unwrap();
        let second = fit_temperature(&logits, &labels).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unit_temperature_keeps_logits() {
        let logits = Tensor::new(&[[1.0f32, -2.0], [0.5, 0.25]], &device()).unwrap();
        let labels = Tensor::new(&[0u32, 1], &device()).unwrap();
        let same = negative_log_likelihood(&logits, &labels, 1.0).unwrap();
        let direct = Criterion::CrossEntropy
            .compute(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((same - f64::from(direct)).abs() < 1e-6);
    }

    #[test]
    fn ece_on_uniform_confidence() {
        // Two classes with identical logits: confidence 0.5, prediction is
        // class 0, so one correct and one wrong label give accuracy 0.5 in
        // the single occupied bin and a zero score.
        let logits = Tensor::new(&[[0.0f32, 0.0], [0.0, 0.0]], &device()).unwrap();
        let labels = Tensor::new(&[0u32, 1], &device()).unwrap();
        let ece = expected_calibration_error(&logits, &labels, 1.0, ECE_BINS).unwrap();
        assert!(ece.abs() < 1e-6);
    }

    #[test]
    fn temperature_gradient_matches_finite_difference() {
        let (logits, labels) = confident_batch();
        let (_, grad) = nll_and_grad(&logits, &labels, 1.5).unwrap();
        let eps = 1e-3;
        let plus = negative_log_likelihood(&logits, &labels, 1.5 + eps).unwrap();
        let minus = negative_log_likelihood(&logits, &labels, 1.5 - eps).unwrap();
        let numeric = (plus - minus) / (2.0 * eps);
        assert!((grad - numeric).abs() < 1e-2, "{} vs {}", grad, numeric);
    }
}
