//! Layered command-line schemas: base options shared by every workflow,
//! extended per workflow, with the distributed options composed beside the
//! training ones.

use clap::builder::RangedU64ValueParser;
use clap::{Args, Parser};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokenizer::TokenizerKind;
use trainer::{InvalidSaveFreq, SaveFreq};

use crate::builtins;
use crate::embed::EMBED_TASK;
use crate::logging::LogLevel;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArgError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("not a file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error(transparent)]
    InvalidSaveFreq(#[from] InvalidSaveFreq),

    #[error("log level must be one of DEBUG, INFO, WARN, WARNING, ERROR or 10, 20, 30, 40, got '{0}'")]
    InvalidLogLevel(String),
}

pub fn check_is_file(value: &str) -> Result<PathBuf, ArgError> {
    let path = PathBuf::from(value);
    if !path.exists() {
        return Err(ArgError::FileNotFound(path));
    }
    if !path.is_file() {
        return Err(ArgError::NotAFile(path));
    }
    Ok(path)
}

pub fn check_is_dir(value: &str) -> Result<PathBuf, ArgError> {
    let path = PathBuf::from(value);
    if !path.exists() {
        return Err(ArgError::FileNotFound(path));
    }
    if !path.is_dir() {
        return Err(ArgError::NotADirectory(path));
    }
    Ok(path)
}

pub fn parse_save_freq(value: &str) -> Result<SaveFreq, ArgError> {
    Ok(value.parse()?)
}

fn batch_size_parser() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(1..)
}

fn parse_model_type(value: &str) -> Result<String, String> {
    let registry = builtins::registry().map_err(|err| err.to_string())?;
    let known = registry.model_types();
    if known.iter().any(|name| name == value) {
        Ok(value.to_string())
    } else {
        Err(format!("unknown model type (registered: {})", known.join(", ")))
    }
}

fn parse_task(value: &str) -> Result<String, String> {
    let registry = builtins::registry().map_err(|err| err.to_string())?;
    let known = registry.tasks();
    if known.iter().any(|name| name == value) {
        Ok(value.to_string())
    } else {
        Err(format!("unknown task (registered: {})", known.join(", ")))
    }
}

#[derive(Args, Debug, Clone, Serialize)]
pub struct BaseArgs {
    /// Base model class to run
    #[arg(value_parser = parse_model_type)]
    pub model_type: String,

    /// Config file for model (JSON or YAML)
    #[arg(long, value_parser = check_is_file)]
    pub model_config_file: Option<PathBuf>,

    /// Directory from which to load task data
    #[arg(long, default_value = "./data", value_parser = check_is_dir)]
    pub data_dir: PathBuf,

    /// Vocabulary file, required by the bpe tokenizer
    #[arg(long, value_parser = check_is_file)]
    pub vocab_file: Option<PathBuf>,

    /// Directory in which to save checkpoints
    #[arg(long, default_value = "./results")]
    pub output_dir: PathBuf,

    /// CPU-only mode
    #[arg(long)]
    pub no_cuda: bool,

    /// Random seed to use
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Local rank of the process in distributed training; -1 means not distributed
    #[arg(long, alias = "local_rank", default_value_t = -1, allow_negative_numbers = true)]
    pub local_rank: i64,

    /// Tokenizes to use on the amino acid sequences
    #[arg(long, default_value = "amino_acid")]
    pub tokenizer: TokenizerKind,

    /// Number of dataloader worker threads
    #[arg(long, default_value_t = 8)]
    pub num_workers: usize,

    /// Log level for the logger
    #[arg(long, default_value = "INFO")]
    pub log_level: LogLevel,

    /// Run in debug mode
    #[arg(long)]
    pub debug: bool,
}

#[derive(Args, Debug, Clone, Serialize)]
pub struct TrainArgs {
    #[command(flatten)]
    #[serde(flatten)]
    pub base: BaseArgs,

    /// Name of the task to train on
    #[arg(value_parser = parse_task)]
    pub task: String,

    /// Learning rate
    #[arg(long, default_value_t = 1e-4)]
    pub learning_rate: f64,

    /// Batch size, summed over processes, devices and accumulation steps
    #[arg(long, default_value_t = 1024, value_parser = batch_size_parser())]
    pub batch_size: usize,

    /// Number of training epochs
    #[arg(long, default_value_t = 10)]
    pub num_train_epochs: usize,

    /// Number of optimizer steps between log lines
    #[arg(long, default_value_t = 20)]
    pub num_log_iter: usize,

    /// Whether to use mixed precision
    #[arg(long)]
    pub fp16: bool,

    /// Number of learning rate warmup steps
    #[arg(long, default_value_t = 10000)]
    pub warmup_steps: usize,

    /// Number of forward passes per optimizer step
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub gradient_accumulation_steps: u64,

    /// Static loss scale for mixed precision; 0 disables scaling
    #[arg(long, default_value_t = 0.0)]
    pub loss_scale: f64,

    /// Maximum gradient norm
    #[arg(long, default_value_t = 1.0)]
    pub max_grad_norm: f64,

    /// Name to give to this experiment
    #[arg(long)]
    pub exp_name: Option<String>,

    /// Directory containing config and pretrained model weights
    #[arg(long, value_parser = check_is_dir)]
    pub from_pretrained: Option<PathBuf>,

    /// Where to write per-epoch training curves
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,

    /// Run train without validation passes
    #[arg(long)]
    pub no_eval: bool,

    /// How often to save the model during training. Either an integer
    /// frequency or the string "improvement"
    #[arg(long, default_value = "1", value_parser = parse_save_freq)]
    pub save_freq: SaveFreq,

    /// How many epochs without improvement to wait before ending training
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub patience: i64,

    /// Whether to resume training from the checkpoint
    #[arg(long)]
    pub resume_from_checkpoint: bool,
}

#[derive(Args, Debug, Clone, Serialize)]
pub struct EvalArgs {
    #[command(flatten)]
    #[serde(flatten)]
    pub base: BaseArgs,

    /// Name of the task to evaluate on
    #[arg(value_parser = parse_task)]
    pub task: String,

    /// Directory containing config and pretrained model weights
    #[arg(value_parser = check_is_dir)]
    pub from_pretrained: PathBuf,

    /// Batch size
    #[arg(long, default_value_t = 1024, value_parser = batch_size_parser())]
    pub batch_size: usize,

    /// Callbacks to use when saving
    #[arg(long, num_args = 0.., default_value = "save_predictions")]
    pub save_callback: Vec<String>,

    /// Metrics to run on the result
    #[arg(long, num_args = 0..)]
    pub metrics: Vec<String>,

    /// Split to run on
    #[arg(long, default_value = "test")]
    pub split: String,
}

#[derive(Args, Debug, Clone, Serialize)]
pub struct EmbedArgs {
    #[command(flatten)]
    #[serde(flatten)]
    pub base: BaseArgs,

    /// Always `embed`
    #[arg(skip = EMBED_TASK.to_string())]
    pub task: String,

    /// FASTA file of sequences to embed
    #[arg(value_parser = check_is_file)]
    pub datafile: PathBuf,

    /// Where to write the embeddings
    pub outfile: PathBuf,

    /// Directory containing config and pretrained model weights
    #[arg(value_parser = check_is_dir)]
    pub from_pretrained: PathBuf,

    /// Batch size
    #[arg(long, default_value_t = 1024, value_parser = batch_size_parser())]
    pub batch_size: usize,
}

#[derive(Args, Debug, Clone, Serialize)]
pub struct DistributedArgs {
    /// Number of nodes to use for distributed training
    #[arg(long, default_value_t = 1)]
    pub nnodes: usize,

    /// The rank of the node for multi-node distributed training
    #[arg(long, alias = "node_rank", default_value_t = 0)]
    pub node_rank: usize,

    /// The number of processes to launch on each node, for GPU training
    /// this is recommended to be set to the number of GPUs in your system
    #[arg(long, alias = "nproc_per_node", default_value_t = 1)]
    pub nproc_per_node: usize,

    /// Master node (rank 0)'s address, should be either the IP address or
    /// the hostname of node 0
    #[arg(long, alias = "master_addr", default_value = "127.0.0.1")]
    pub master_addr: String,

    /// Master node (rank 0)'s free port that needs to be used for
    /// communication during distributed training
    #[arg(long, alias = "master_port", default_value_t = 29500)]
    pub master_port: u16,
}

#[derive(Args, Debug, Clone, Serialize)]
pub struct DistributedTrainArgs {
    #[command(flatten)]
    #[serde(flatten)]
    pub train: TrainArgs,

    #[command(flatten)]
    #[serde(flatten)]
    pub distributed: DistributedArgs,
}

#[derive(Args, Debug, Clone, Serialize)]
pub struct GridsearchArgs {
    /// JSON or YAML file of run arguments; list values are searched over
    #[arg(value_parser = check_is_file)]
    pub config_file: PathBuf,
}

/// Standalone training parser, used when no request is passed in.
#[derive(Parser, Debug)]
#[command(name = "tape-train", about = "Run training on the TAPE datasets")]
pub struct TrainCli {
    #[command(flatten)]
    pub args: TrainArgs,
}

#[derive(Parser, Debug)]
#[command(name = "tape-eval", about = "Run evaluation on the TAPE datasets")]
pub struct EvalCli {
    #[command(flatten)]
    pub args: EvalArgs,
}

#[derive(Parser, Debug)]
#[command(name = "tape-embed", about = "Embed a set of proteins with a pretrained model")]
pub struct EmbedCli {
    #[command(flatten)]
    pub args: EmbedArgs,
}

#[derive(Parser, Debug)]
#[command(
    name = "tape-train-distributed",
    about = "Run distributed training on the TAPE datasets"
)]
pub struct DistributedTrainCli {
    #[command(flatten)]
    pub args: DistributedTrainArgs,
}
