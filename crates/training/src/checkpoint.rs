use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use candle_nn::VarMap;

use crate::config::TrainingError;

/// Default parameter snapshot filename inside the save directory.
pub const MODEL_FILENAME: &str = "model.safetensors";
/// Default calibrated snapshot filename.
pub const CALIBRATED_FILENAME: &str = "model_C_ts.safetensors";
/// Append-only audit log of best-checkpoint events.
pub const DETAIL_LOG_FILENAME: &str = "model_ckpt_detail.txt";

/// Persists every parameter of `varmap` as a safetensors blob.
pub fn save_parameters(varmap: &VarMap, path: &Path) -> Result<(), TrainingError> {
    varmap.save(path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to save parameters to {}: {}",
            path.display(),
            err
        ))
    })
}

/// Loads a previously persisted snapshot into `varmap`. A missing file is a
/// fatal configuration error, surfaced before any computation.
pub fn load_parameters(varmap: &mut VarMap, path: &Path) -> Result<(), TrainingError> {
    if !path.exists() {
        return Err(TrainingError::initialization(format!(
            "cannot find file {} to load",
            path.display()
        )));
    }
    varmap.load(path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to load parameters from {}: {}",
            path.display(),
            err
        ))
    })
}

/// Appends one best-checkpoint record to the audit log in `save_dir`.
pub fn append_best_record(
    save_dir: &Path,
    epoch: usize,
    best_error: f64,
) -> Result<(), TrainingError> {
    let path = save_dir.join(DETAIL_LOG_FILENAME);
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "epoch {} reaches new best error {:.4}", epoch, best_error)?;
    Ok(())
}

/// `last_<filename>` path used for the unconditional final snapshot.
pub fn last_snapshot_path(save_dir: &Path, model_filename: &str) -> PathBuf {
    save_dir.join(format!("last_{}", model_filename))
}
