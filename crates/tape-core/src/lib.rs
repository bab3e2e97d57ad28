pub mod batch;
pub mod capability;
pub mod error;
pub mod outputs;
pub mod registry;

pub use batch::{collate, tensor_to_values, Batch, Example, ModelOutput, Target};
pub use capability::{
    DatasetFactory, DatasetSpec, FieldValues, Metric, ModelFamily, ModelSpec, SaveCallback,
    TaskDataset, TaskModel,
};
pub use error::{CapabilityClass, OutputsError, RegistryError};
pub use outputs::{merge_fields, SaveOutputs};
pub use registry::Registry;
