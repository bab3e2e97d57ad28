pub mod args;
pub mod builtins;
pub mod embed;
pub mod error;
pub mod eval;
pub mod gridsearch;
pub mod launcher;
pub mod logging;
pub mod request;
pub mod train;

pub use embed::{run_embed, run_embed_with, EmbedParams};
pub use error::{Result, TapeError};
pub use eval::{run_eval, run_eval_with, EvalParams};
pub use gridsearch::{run_gridsearch, run_gridsearch_with, GridPoint, GridsearchReport};
pub use launcher::{
    launch, launch_distributed_train, launch_with_grace, run_train_distributed, LaunchConfig,
};
pub use logging::{setup_logging, LogLevel};
pub use request::{FromRunRequest, RunRequest};
pub use train::{run_train, run_train_with, Extensions};
