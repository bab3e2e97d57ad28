use std::fmt;
use thiserror::Error;

/// The four kinds of pluggable named behavior the registry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityClass {
    Model,
    Dataset,
    Metric,
    SaveCallback,
}

impl fmt::Display for CapabilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Model => "model",
            Self::Dataset => "dataset",
            Self::Metric => "metric",
            Self::SaveCallback => "save callback",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{class} '{name}' is already registered")]
    DuplicateName { class: CapabilityClass, name: String },

    #[error("unknown {class} '{name}' (registered: {})", .known.join(", "))]
    UnknownName {
        class: CapabilityClass,
        name: String,
        known: Vec<String>,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutputsError {
    #[error("field '{field}' has {found} values in a batch of {expected} examples")]
    Ragged {
        field: String,
        expected: usize,
        found: usize,
    },

    #[error("batch is missing field '{0}' that earlier batches produced")]
    MissingField(String),

    #[error("batch produced new field '{0}' after the first batch")]
    UnexpectedField(String),

    #[error("field '{0}' was produced by more than one save callback")]
    DuplicateField(String),
}
