pub mod checkpoint;
pub mod config;
pub mod data;
pub mod epoch;
pub mod loss;
pub mod meter;
pub mod optimizer;
pub mod scheduler;
pub mod temperature;
pub mod trainer;

pub use config::{TrainingConfig, TrainingError};
pub use data::{ImageDataset, TensorBatches};
pub use epoch::{run_epoch, run_epoch_fast, EpochMode, EpochRun, EpochStats};
pub use loss::Criterion;
pub use meter::Meter;
pub use optimizer::{ModelOptimizer, OptimizerConfig};
pub use scheduler::{LrSchedule, SchedulerConfig};
pub use temperature::{calibrate, ModelWithTemperature};
pub use trainer::train;
