use clap::Parser;
use trainer::{TrainParams, TrainSummary};

use crate::args::TrainCli;
use crate::builtins;
use crate::error::{Result, TapeError};
use crate::logging::{level_from_request, setup_logging};
use crate::request::RunRequest;

/// Optional capabilities of this build and machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extensions {
    /// Mixed precision needs CUDA kernels in the linked libtorch.
    pub mixed_precision: bool,
    /// Multi-process training needs the collective backend compiled in.
    pub distributed: bool,
}

impl Extensions {
    pub fn detect() -> Self {
        Self {
            mixed_precision: tch::Cuda::is_available(),
            distributed: cfg!(feature = "distributed"),
        }
    }
}

pub fn check_gradient_accumulation(request: &RunRequest) -> Result<()> {
    let Some(value) = request.get("gradient_accumulation_steps") else {
        // Reported with the other missing names on resolve.
        return Ok(());
    };
    match value.as_i64() {
        Some(steps) if steps >= 1 => Ok(()),
        _ => Err(TapeError::config(format!(
            "Invalid gradient_accumulation_steps parameter: {}, should be >= 1",
            value
        ))),
    }
}

pub fn check_extensions(request: &RunRequest, extensions: &Extensions) -> Result<()> {
    if request.get_bool("fp16") == Some(true) && !extensions.mixed_precision {
        return Err(TapeError::FeatureUnavailable {
            feature: "mixed precision training",
            hint: "link a CUDA-enabled libtorch and run on a CUDA device",
        });
    }
    let local_rank = request.get_i64("local_rank").unwrap_or(-1);
    if local_rank != -1 && !extensions.distributed {
        return Err(TapeError::FeatureUnavailable {
            feature: "distributed training",
            hint: "Build with --features distributed",
        });
    }
    Ok(())
}

/// Validates `request` and hands the resolved parameters to `workflow`.
/// Nothing reaches the workflow unless every precondition holds.
pub fn run_train_with<R, F>(request: &RunRequest, extensions: &Extensions, workflow: F) -> Result<R>
where
    F: FnOnce(TrainParams) -> anyhow::Result<R>,
{
    check_gradient_accumulation(request)?;
    check_extensions(request, extensions)?;
    let params: TrainParams = request.resolve()?;
    workflow(params).map_err(TapeError::Other)
}

/// Runs training for `request`, or for the process arguments when none is
/// given.
pub fn run_train(request: Option<RunRequest>) -> Result<TrainSummary> {
    let request = match request {
        Some(request) => request,
        None => RunRequest::from_args(&TrainCli::parse().args)?,
    };
    let level = level_from_request(&request)?;

    run_train_with(&request, &Extensions::detect(), |mut params| {
        // Fixed here so the log file and the checkpoints share one directory.
        let exp_name = params.resolved_exp_name();
        params.exp_name = Some(exp_name.clone());
        let save_path = params.output_dir.join(&exp_name);
        setup_logging(params.local_rank, Some(save_path.as_path()), level)?;

        let registry = builtins::registry()?;
        trainer::run_train(registry, params)
    })
}
