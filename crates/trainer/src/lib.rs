pub mod callbacks;
pub mod collective;
pub mod distributed;
pub mod metrics;
pub mod parallel;
pub mod params;
pub mod runner;
pub mod schedule;
pub mod train;

pub use distributed::{setup_distributed, DeviceSetup};
pub use parallel::DataParallel;
pub use params::{default_exp_name, InvalidSaveFreq, SaveFreq, TrainParams};
pub use runner::{progress_bar, run_eval_epoch, EvalOutcome, ForwardRunner};
pub use train::{run_train, TrainSummary, Trainer, TrainingState};

use tape_core::{Registry, RegistryError};

/// Registers the built-in metrics and save callbacks.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_metric("mse", metrics::mean_squared_error)?;
    registry.register_metric("mae", metrics::mean_absolute_error)?;
    registry.register_metric("spearmanr", metrics::spearmanr)?;
    registry.register_metric("accuracy", metrics::accuracy)?;
    registry.register_callback("save_predictions", callbacks::save_predictions)?;
    registry.register_callback("save_embedding", callbacks::save_embedding)?;
    Ok(())
}
