pub mod loader;
pub mod tasks;

pub use loader::{effective_batch_size, DataLoader, LoaderOptions, Shard};
pub use tasks::{FastaDataset, JsonlDataset, MaskedLanguageModelingDataset};

use tape_core::{Registry, RegistryError};

/// Registers the dataset of every built-in task.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_dataset("embed", tasks::embed)?;
    registry.register_dataset("masked_language_modeling", tasks::masked_language_modeling)?;
    registry.register_dataset("fluorescence", tasks::fluorescence)?;
    registry.register_dataset("stability", tasks::stability)?;
    registry.register_dataset("remote_homology", tasks::remote_homology)?;
    Ok(())
}
