use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use datasets::{DataLoader, LoaderOptions};
use tape_core::{DatasetSpec, Metric, ModelSpec, Registry, SaveCallback};
use tokenizer::{Tokenizer, TokenizerKind};
use trainer::distributed::set_random_seeds;
use trainer::{run_eval_epoch, setup_distributed, ForwardRunner};

use crate::args::EvalCli;
use crate::builtins;
use crate::error::{Result, TapeError};
use crate::logging::{level_from_request, setup_logging};
use crate::request::{FromRunRequest, RunRequest};

pub const RESULTS_FILE_NAME: &str = "results.json";
const PREDICTIONS_CALLBACK: &str = "save_predictions";

#[derive(Debug, Clone, Deserialize)]
pub struct EvalParams {
    pub model_type: String,
    pub task: String,
    pub from_pretrained: PathBuf,
    pub model_config_file: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub vocab_file: Option<PathBuf>,
    pub tokenizer: TokenizerKind,
    pub no_cuda: bool,
    pub seed: u64,
    pub num_workers: usize,
    pub batch_size: usize,
    pub save_callback: Vec<String>,
    pub metrics: Vec<String>,
    pub split: String,
}

impl FromRunRequest for EvalParams {
    const FIELDS: &'static [&'static str] = &[
        "model_type",
        "task",
        "from_pretrained",
        "model_config_file",
        "data_dir",
        "vocab_file",
        "tokenizer",
        "no_cuda",
        "seed",
        "num_workers",
        "batch_size",
        "save_callback",
        "metrics",
        "split",
    ];
}

/// Preconditions shared by the inference passes: a pretrained model, a
/// non-empty batch and a single process.
pub(crate) fn check_inference_request(request: &RunRequest, pass: &str) -> Result<()> {
    match request.get("from_pretrained") {
        None | Some(serde_json::Value::Null) => {
            return Err(TapeError::config("Must specify pretrained model"));
        }
        Some(_) => {}
    }
    if request.get("batch_size").and_then(|v| v.as_u64()) == Some(0) {
        return Err(TapeError::config(format!(
            "Invalid batch_size for {}: 0, should be >= 1",
            pass
        )));
    }
    let local_rank = request.get_i64("local_rank").unwrap_or(-1);
    if local_rank != -1 {
        return Err(TapeError::config(format!(
            "Distributed {} is not supported, got local rank {}",
            pass, local_rank
        )));
    }
    Ok(())
}

pub(crate) fn load_tokenizer(
    kind: TokenizerKind,
    vocab_file: Option<&Path>,
) -> anyhow::Result<Arc<Tokenizer>> {
    Ok(Arc::new(Tokenizer::new(kind, vocab_file)?))
}

/// Evaluates a pretrained model on one split and writes `results.json` into
/// the model directory. Every name is looked up before any device work.
pub fn run_eval_with(request: &RunRequest, registry: &Registry) -> Result<BTreeMap<String, f64>> {
    check_inference_request(request, "evaluation")?;
    let params: EvalParams = request.resolve()?;

    let mut callback_names = params.save_callback.clone();
    if !params.metrics.is_empty() && !callback_names.iter().any(|n| n == PREDICTIONS_CALLBACK) {
        callback_names.push(PREDICTIONS_CALLBACK.to_string());
    }
    let callbacks = callback_names
        .iter()
        .map(|name| registry.callback(name))
        .collect::<std::result::Result<Vec<&dyn SaveCallback>, _>>()?;
    let metrics = params
        .metrics
        .iter()
        .map(|name| registry.metric(name).map(|metric| (name.as_str(), metric)))
        .collect::<std::result::Result<Vec<(&str, &dyn Metric)>, _>>()?;
    let family = registry.model(&params.model_type, &params.task)?;
    let factory = registry.dataset(&params.task)?;

    let setup = setup_distributed(-1, params.no_cuda)?;
    set_random_seeds(params.seed, setup.n_gpu);

    let tokenizer = load_tokenizer(params.tokenizer, params.vocab_file.as_deref())?;
    let runner = ForwardRunner::build(
        family,
        &ModelSpec {
            model_type: params.model_type.clone(),
            task: params.task.clone(),
            config_file: params.model_config_file.clone(),
            from_pretrained: Some(params.from_pretrained.clone()),
            vocab_size: tokenizer.vocab_size(),
            device: setup.device,
        },
        setup.n_gpu,
    )?;
    let dataset = factory.build(&DatasetSpec {
        data_dir: params.data_dir.clone(),
        split: params.split.clone(),
        tokenizer: tokenizer.clone(),
        seed: params.seed,
    })?;
    let loader = DataLoader::new(
        dataset,
        LoaderOptions {
            batch_size: params.batch_size,
            pad_id: tokenizer.pad_id(),
            seed: params.seed,
            num_workers: params.num_workers,
            ..Default::default()
        },
    )?;

    log::info!("***** Running evaluation on {} *****", params.split);
    log::info!("  Num examples = {}", loader.num_examples());
    let mut outcome = run_eval_epoch(&loader, &runner, setup.is_master, &callbacks)?;
    if let Some(loss) = outcome.loss {
        log::info!("Evaluation loss: {:.4}", loss);
    }

    let mut results = BTreeMap::new();
    if !metrics.is_empty() {
        let model = runner.model();
        let targets = outcome
            .outputs
            .field(model.target_key())
            .with_context(|| format!("No '{}' field was saved", model.target_key()))?;
        let predictions = outcome
            .outputs
            .field(model.prediction_key())
            .with_context(|| format!("No '{}' field was saved", model.prediction_key()))?;
        for (name, metric) in &metrics {
            let value = metric
                .compute(targets, predictions)
                .with_context(|| format!("Metric '{}' failed", name))?;
            results.insert(name.to_string(), value);
        }
    }
    outcome.outputs.insert_metrics(&results);
    log::info!("Evaluation Metrics: {:?}", results);

    let results_path = params.from_pretrained.join(RESULTS_FILE_NAME);
    outcome.outputs.write_json(&results_path)?;
    log::info!("Saved results to {}", results_path.display());
    Ok(results)
}

/// Runs evaluation for `request`, or for the process arguments when none is
/// given, and returns the computed metrics.
pub fn run_eval(request: Option<RunRequest>) -> Result<BTreeMap<String, f64>> {
    let request = match request {
        Some(request) => request,
        None => RunRequest::from_args(&EvalCli::parse().args)?,
    };
    check_inference_request(&request, "evaluation")?;
    setup_logging(-1, None, level_from_request(&request)?)?;
    run_eval_with(&request, builtins::registry()?)
}
