use std::{fs, path::Path};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use model::{get_model, NetArch};

use crate::checkpoint;
use crate::config::{EpochVariant, TrainingConfig, TrainingError};
use crate::data::ImageDataset;
use crate::epoch::{run_epoch, run_epoch_fast, EpochMode, EpochRun};
use crate::loss::Criterion;
use crate::optimizer::{named_parameters, ModelOptimizer, OptimizerConfig};
use crate::scheduler::SchedulerConfig;

/// Fits the configured architecture on `dataset`, checkpointing the best
/// validation-error snapshot to `<save_dir>/<model_filename>` and the final
/// state to `<save_dir>/last_<model_filename>`.
pub fn train(
    dataset: &ImageDataset,
    arch: &NetArch,
    config: &TrainingConfig,
    save_dir: &Path,
    device: &Device,
    model_filename: &str,
) -> Result<(), TrainingError> {
    if !save_dir.exists() {
        fs::create_dir_all(save_dir)?;
    }
    if !save_dir.is_dir() {
        return Err(TrainingError::initialization(format!(
            "{} is not a directory",
            save_dir.display()
        )));
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = get_model(arch, config.weight_init, vb).map_err(|err| {
        TrainingError::initialization(format!("failed to build model: {}", err))
    })?;

    let criterion = Criterion::from(config.loss_fn);
    let parameters = named_parameters(&varmap);
    let mut optimizer =
        ModelOptimizer::new(parameters.clone(), OptimizerConfig::from_training_config(config))?;
    let mut schedule = SchedulerConfig::from_training_config(config).build()?;

    if config.warmup > 0 {
        let mut warmup_optimizer =
            ModelOptimizer::new(parameters, OptimizerConfig::warmup(config))?;
        for warmup_epoch in 1..=config.warmup {
            run_epoch(EpochRun {
                loader: &dataset.train,
                model: model.as_ref(),
                criterion,
                optimizer: &mut warmup_optimizer,
                mode: EpochMode::Train,
                epoch: warmup_epoch,
                n_epochs: config.warmup,
                log_every_step: config.log_every_step,
            })?;
        }
    }

    let mut best_error = 1.0f64;
    for epoch in 1..=config.n_epochs {
        let train_run = EpochRun {
            loader: &dataset.train,
            model: model.as_ref(),
            criterion,
            optimizer: &mut optimizer,
            mode: EpochMode::Train,
            epoch,
            n_epochs: config.n_epochs,
            log_every_step: config.log_every_step,
        };
        match config.run_epoch {
            EpochVariant::Fast => run_epoch_fast(train_run)?,
            EpochVariant::Standard => run_epoch(train_run)?,
        };

        let valid = run_epoch(EpochRun {
            loader: &dataset.valid,
            model: model.as_ref(),
            criterion,
            optimizer: &mut optimizer,
            mode: EpochMode::Eval,
            epoch,
            n_epochs: config.n_epochs,
            log_every_step: config.log_every_step,
        })?;

        if valid.error < best_error {
            best_error = valid.error;
            println!("New best error: {:.4}", best_error);
            checkpoint::save_parameters(&varmap, &save_dir.join(model_filename))?;
            checkpoint::append_best_record(save_dir, epoch, best_error)?;
        }

        let lr = schedule.step(valid.error);
        optimizer.set_learning_rate(lr);
    }

    checkpoint::save_parameters(&varmap, &checkpoint::last_snapshot_path(save_dir, model_filename))?;
    println!("Train Done!");
    Ok(())
}
