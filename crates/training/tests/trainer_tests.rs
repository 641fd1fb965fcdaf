use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use model::config::{DenseNetConfig, NetArch};
use model::WeightInit;
use tempfile::tempdir;
use training::config::{EpochVariant, LossKind, OptimizerKind, SchedulerKind};
use training::{calibrate, checkpoint, train, ImageDataset, TensorBatches, TrainingConfig};

const NUM_CLASSES: usize = 3;

fn tiny_arch() -> NetArch {
    NetArch::DenseNet(DenseNetConfig {
        growth_rate: 4,
        block_config: vec![2],
        num_init_features: 8,
        bn_size: 2,
        dropout_rate: 0.0,
        num_classes: NUM_CLASSES,
        small_inputs: true,
    })
}

// Labels cycle through the classes so that even a constant predictor leaves
// some of the validation split correct and the first epoch improves on the
// initial best error of 1.0.
fn tiny_split(samples: usize, batch_size: usize, device: &Device) -> TensorBatches {
    let images = Tensor::rand(0.0f32, 1.0, (samples, 3, 8, 8), device).expect("images");
    let labels: Vec<u32> = (0..samples).map(|i| (i % NUM_CLASSES) as u32).collect();
    let labels = Tensor::new(labels, device).expect("labels");
    TensorBatches::new(images, labels, batch_size).expect("batches")
}

fn tiny_dataset(device: &Device) -> ImageDataset {
    ImageDataset {
        train: tiny_split(12, 4, device),
        valid: tiny_split(6, 4, device),
    }
}

fn base_config(n_epochs: usize) -> TrainingConfig {
    TrainingConfig {
        n_epochs,
        lr: 0.05,
        wd: 0.0,
        momentum: 0.9,
        optimizer: OptimizerKind::Sgd,
        lr_scheduler: SchedulerKind::Halfway,
        loss_fn: LossKind::CrossEntropy,
        warmup: 0,
        weight_init: WeightInit::Default,
        run_epoch: EpochVariant::Standard,
        log_every_step: false,
        seed: 0,
        batch_size: 4,
        data_path: None,
    }
}

fn best_errors(save_dir: &Path) -> Vec<f64> {
    let contents =
        fs::read_to_string(save_dir.join(checkpoint::DETAIL_LOG_FILENAME)).expect("detail log");
    contents
        .lines()
        .map(|line| {
            assert!(
                line.starts_with("epoch ") && line.contains(" reaches new best error "),
                "unexpected detail line: {}",
                line
            );
            line.rsplit(' ').next().expect("error field").parse().expect("error value")
        })
        .collect()
}

#[test]
fn zero_epochs_writes_only_the_last_snapshot() {
    let device = Device::Cpu;
    let dir = tempdir().expect("tempdir");
    let dataset = tiny_dataset(&device);

    train(
        &dataset,
        &tiny_arch(),
        &base_config(0),
        dir.path(),
        &device,
        checkpoint::MODEL_FILENAME,
    )
    .expect("training");

    assert!(dir
        .path()
        .join(format!("last_{}", checkpoint::MODEL_FILENAME))
        .is_file());
    assert!(!dir.path().join(checkpoint::MODEL_FILENAME).exists());
    assert!(!dir.path().join(checkpoint::DETAIL_LOG_FILENAME).exists());
}

#[test]
fn best_checkpoint_and_detail_log_track_improvements() {
    let device = Device::Cpu;
    let dir = tempdir().expect("tempdir");
    let dataset = tiny_dataset(&device);

    train(
        &dataset,
        &tiny_arch(),
        &base_config(2),
        dir.path(),
        &device,
        checkpoint::MODEL_FILENAME,
    )
    .expect("training");

    assert!(dir.path().join(checkpoint::MODEL_FILENAME).is_file());
    assert!(dir
        .path()
        .join(format!("last_{}", checkpoint::MODEL_FILENAME))
        .is_file());

    let errors = best_errors(dir.path());
    assert!(!errors.is_empty());
    for pair in errors.windows(2) {
        assert!(pair[1] < pair[0], "detail log errors must strictly decrease");
    }
    assert!(errors.iter().all(|e| *e < 1.0));
}

#[test]
fn warmup_epochs_run_before_the_main_loop() {
    let device = Device::Cpu;
    let dir = tempdir().expect("tempdir");
    let dataset = tiny_dataset(&device);

    let mut config = base_config(1);
    config.warmup = 1;
    config.run_epoch = EpochVariant::Fast;

    train(
        &dataset,
        &tiny_arch(),
        &config,
        dir.path(),
        &device,
        checkpoint::MODEL_FILENAME,
    )
    .expect("training with warmup");

    assert!(dir
        .path()
        .join(format!("last_{}", checkpoint::MODEL_FILENAME))
        .is_file());
}

#[test]
fn warmup_alone_never_checkpoints() {
    let device = Device::Cpu;
    let dir = tempdir().expect("tempdir");
    let dataset = tiny_dataset(&device);

    let mut config = base_config(0);
    config.warmup = 2;

    train(
        &dataset,
        &tiny_arch(),
        &config,
        dir.path(),
        &device,
        checkpoint::MODEL_FILENAME,
    )
    .expect("warmup-only training");

    assert!(dir
        .path()
        .join(format!("last_{}", checkpoint::MODEL_FILENAME))
        .is_file());
    assert!(!dir.path().join(checkpoint::MODEL_FILENAME).exists());
    assert!(!dir.path().join(checkpoint::DETAIL_LOG_FILENAME).exists());
}

#[test]
fn calibration_writes_a_scaled_snapshot() {
    let device = Device::Cpu;
    let dir = tempdir().expect("tempdir");
    let dataset = tiny_dataset(&device);

    train(
        &dataset,
        &tiny_arch(),
        &base_config(1),
        dir.path(),
        &device,
        checkpoint::MODEL_FILENAME,
    )
    .expect("training");

    calibrate(
        &dataset,
        &tiny_arch(),
        dir.path(),
        &device,
        checkpoint::MODEL_FILENAME,
        checkpoint::CALIBRATED_FILENAME,
    )
    .expect("calibration");

    assert!(dir.path().join(checkpoint::CALIBRATED_FILENAME).is_file());
}

#[test]
fn calibration_without_a_snapshot_is_fatal() {
    let device = Device::Cpu;
    let dir = tempdir().expect("tempdir");
    let dataset = tiny_dataset(&device);

    let result = calibrate(
        &dataset,
        &tiny_arch(),
        dir.path(),
        &device,
        checkpoint::MODEL_FILENAME,
        checkpoint::CALIBRATED_FILENAME,
    );
    assert!(result.is_err());
}
