use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use datasets::{DataLoader, LoaderOptions};
use tape_core::{DatasetSpec, FieldValues, ModelSpec, Registry, SaveOutputs};
use tokenizer::TokenizerKind;
use trainer::distributed::set_random_seeds;
use trainer::{progress_bar, setup_distributed, ForwardRunner};

use crate::args::EmbedCli;
use crate::builtins;
use crate::error::Result;
use crate::eval::{check_inference_request, load_tokenizer};
use crate::logging::{level_from_request, setup_logging};
use crate::request::{FromRunRequest, RunRequest};

pub const EMBED_TASK: &str = "embed";
const EMBEDDING_CALLBACK: &str = "save_embedding";

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedParams {
    pub model_type: String,
    pub from_pretrained: PathBuf,
    pub model_config_file: Option<PathBuf>,
    pub vocab_file: Option<PathBuf>,
    pub tokenizer: TokenizerKind,
    pub no_cuda: bool,
    pub seed: u64,
    pub num_workers: usize,
    pub batch_size: usize,
    pub datafile: PathBuf,
    pub outfile: PathBuf,
}

impl FromRunRequest for EmbedParams {
    const FIELDS: &'static [&'static str] = &[
        "model_type",
        "from_pretrained",
        "model_config_file",
        "vocab_file",
        "tokenizer",
        "no_cuda",
        "seed",
        "num_workers",
        "batch_size",
        "datafile",
        "outfile",
    ];
}

/// Embeds every sequence of `datafile` and writes ids and embeddings, in file
/// order, to `outfile` with a `.json` extension. Returns the written path.
pub fn run_embed_with(request: &RunRequest, registry: &Registry) -> Result<PathBuf> {
    check_inference_request(request, "embedding")?;
    let params: EmbedParams = request.resolve()?;

    let callback = registry.callback(EMBEDDING_CALLBACK)?;
    let family = registry.model(&params.model_type, EMBED_TASK)?;
    let factory = registry.dataset(EMBED_TASK)?;

    let setup = setup_distributed(-1, params.no_cuda)?;
    set_random_seeds(params.seed, setup.n_gpu);

    let tokenizer = load_tokenizer(params.tokenizer, params.vocab_file.as_deref())?;
    let runner = ForwardRunner::build(
        family,
        &ModelSpec {
            model_type: params.model_type.clone(),
            task: EMBED_TASK.to_string(),
            config_file: params.model_config_file.clone(),
            from_pretrained: Some(params.from_pretrained.clone()),
            vocab_size: tokenizer.vocab_size(),
            device: setup.device,
        },
        setup.n_gpu,
    )?;
    // The embed dataset reads the file named by its split.
    let dataset = factory.build(&DatasetSpec {
        data_dir: PathBuf::new(),
        split: params.datafile.to_string_lossy().into_owned(),
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

    let _no_grad = tch::no_grad_guard();
    let pb = progress_bar(loader.len(), setup.is_master, "Embedding sequences");
    let mut outputs = SaveOutputs::new();
    for batch in loader.iter() {
        let batch = batch?;
        let output = runner.forward(&batch, false)?;
        let fields: FieldValues = callback.save(runner.model(), &batch, &output)?;
        outputs
            .extend(fields)
            .context("Embedding callback produced inconsistent fields")?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    let outfile = params.outfile.with_extension("json");
    if let Some(dir) = outfile.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    outputs.write_json(&outfile)?;
    log::info!("Saved {} embeddings to {}", outputs.len(), outfile.display());
    Ok(outfile)
}

/// Runs embedding for `request`, or for the process arguments when none is
/// given.
pub fn run_embed(request: Option<RunRequest>) -> Result<PathBuf> {
    let request = match request {
        Some(request) => request,
        None => RunRequest::from_args(&EmbedCli::parse().args)?,
    };
    check_inference_request(&request, "embedding")?;
    setup_logging(-1, None, level_from_request(&request)?)?;
    run_embed_with(&request, builtins::registry()?)
}
