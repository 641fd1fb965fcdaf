use std::{
    env, fs,
    io::Write,
    path::{Path, PathBuf},
};

use candle_core::Device;
use clap::{Parser, ValueEnum};
use model::NetArch;
use training::{calibrate, checkpoint, train, ImageDataset, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Image classifier training CLI", long_about = None)]
struct Args {
    /// Run directory holding `cfg/` and receiving checkpoints and logs.
    #[arg(value_name = "DESTINATION_DIR")]
    destination_dir: PathBuf,

    #[arg(long = "device_type", value_enum, default_value = "cuda")]
    device_type: DeviceType,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceType {
    Cpu,
    Cuda,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    record_invocation()?;

    let destination = &args.destination_dir;
    if !destination.is_dir() {
        return Err(TrainingError::initialization(format!(
            "{} is not a directory",
            destination.display()
        )));
    }

    let arch = load_net_arch(&config_file(destination, "net_arch")?)?;
    let config = TrainingConfig::from_path(&config_file(destination, "trn_para")?)?;

    let device = match args.device_type {
        DeviceType::Cpu => Device::Cpu,
        DeviceType::Cuda => Device::new_cuda(0).map_err(|err| {
            TrainingError::initialization(format!("cannot open cuda device: {}", err))
        })?,
    };
    if let Err(err) = device.set_seed(config.seed) {
        eprintln!("warning: failed to seed device RNG: {}", err);
    }

    let data_path = config.data_path.clone().ok_or_else(|| {
        TrainingError::ConfigFormat("trn_para must set data_path".to_string())
    })?;
    let dataset = ImageDataset::from_safetensors(&data_path, config.batch_size, &device)?;

    let save_dir = destination.join("outputs");
    train(
        &dataset,
        &arch,
        &config,
        &save_dir,
        &device,
        checkpoint::MODEL_FILENAME,
    )?;
    calibrate(
        &dataset,
        &arch,
        &save_dir,
        &device,
        checkpoint::MODEL_FILENAME,
        checkpoint::CALIBRATED_FILENAME,
    )?;
    Ok(())
}

/// Appends the full command line to `CMDs/step_train_network.cmd` in the
/// working directory, before any argument is validated, so even aborted
/// invocations leave an audit record.
fn record_invocation() -> Result<(), TrainingError> {
    fs::create_dir_all("CMDs")?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("CMDs/step_train_network.cmd")?;
    let argv: Vec<String> = env::args().collect();
    writeln!(file, "{}", argv.join(" "))?;
    writeln!(file, "--------------------------------")?;
    Ok(())
}

/// Resolves `cfg/<stem>.toml` or `cfg/<stem>.json` under the run directory.
fn config_file(destination: &Path, stem: &str) -> Result<PathBuf, TrainingError> {
    let cfg_dir = destination.join("cfg");
    for ext in ["toml", "json"] {
        let candidate = cfg_dir.join(format!("{}.{}", stem, ext));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(TrainingError::initialization(format!(
        "no {}.toml or {}.json under {}",
        stem,
        stem,
        cfg_dir.display()
    )))
}

fn load_net_arch(path: &Path) -> Result<NetArch, TrainingError> {
    let contents = fs::read_to_string(path)?;
    let arch: NetArch = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)?,
        _ => toml::from_str(&contents)?,
    };
    arch.validate()
        .map_err(|msg| TrainingError::Validation(vec![msg]))?;
    Ok(arch)
}
