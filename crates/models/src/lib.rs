pub mod config;
pub mod model;
pub mod safetensors_util;

pub use config::ModelConfig;
pub use model::{ProteinModel, TaskKind};

use tape_core::{ModelSpec, Registry, RegistryError, TaskModel};

pub const ONEHOT_TASKS: &[&str] = &["embed", "fluorescence", "stability", "remote_homology"];
pub const LSTM_TASKS: &[&str] = &[
    "embed",
    "fluorescence",
    "stability",
    "remote_homology",
    "masked_language_modeling",
];

pub fn build(spec: &ModelSpec) -> anyhow::Result<Box<dyn TaskModel>> {
    Ok(Box::new(ProteinModel::new(spec)?))
}

/// Registers every built-in (model family, task) pair.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    for task in ONEHOT_TASKS {
        registry.register_model("onehot", task, build)?;
    }
    for task in LSTM_TASKS {
        registry.register_model("lstm", task, build)?;
    }
    Ok(())
}
