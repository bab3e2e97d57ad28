use tape_core::RegistryError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TapeError>;

#[derive(Debug, Error)]
pub enum TapeError {
    /// Invalid or contradictory arguments, found before any work starts.
    #[error("{0}")]
    Config(String),

    #[error("{feature} is not available: {hint}")]
    FeatureUnavailable {
        feature: &'static str,
        hint: &'static str,
    },

    /// Names the training workflow declares but the run request lacks, sorted.
    #[error("Missing arguments: {}", .0.join(", "))]
    MissingArguments(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("worker with local rank {rank} {}", exit_description(.code))]
    WorkerFailure { rank: usize, code: Option<i32> },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

impl TapeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
