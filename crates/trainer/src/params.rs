use rand::Rng;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tokenizer::TokenizerKind;

/// When checkpoints are written: every `n` epochs, or whenever the
/// validation loss improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFreq {
    Every(usize),
    Improvement,
}

impl Default for SaveFreq {
    fn default() -> Self {
        Self::Every(1)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("save frequency must be a positive integer or 'improvement', got '{0}'")]
pub struct InvalidSaveFreq(pub String);

impl FromStr for SaveFreq {
    type Err = InvalidSaveFreq;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "improvement" {
            return Ok(Self::Improvement);
        }
        match s.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Self::Every(n)),
            _ => Err(InvalidSaveFreq(s.to_string())),
        }
    }
}

impl fmt::Display for SaveFreq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(n) => write!(f, "{}", n),
            Self::Improvement => f.write_str("improvement"),
        }
    }
}

impl Serialize for SaveFreq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Every(n) => serializer.serialize_u64(*n as u64),
            Self::Improvement => serializer.serialize_str("improvement"),
        }
    }
}

struct SaveFreqVisitor;

impl<'de> Visitor<'de> for SaveFreqVisitor {
    type Value = SaveFreq;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a positive integer or \"improvement\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<SaveFreq, E> {
        SaveFreq::from_str(&v.to_string()).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<SaveFreq, E> {
        SaveFreq::from_str(&v.to_string()).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<SaveFreq, E> {
        SaveFreq::from_str(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for SaveFreq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SaveFreqVisitor)
    }
}

/// Everything the training workflow reads from a run request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainParams {
    pub model_type: String,
    pub task: String,
    pub learning_rate: f64,
    /// Total over all processes, devices and accumulation steps.
    pub batch_size: usize,
    pub num_train_epochs: usize,
    pub num_log_iter: usize,
    pub fp16: bool,
    pub warmup_steps: usize,
    pub gradient_accumulation_steps: usize,
    /// Static loss scale for mixed precision; 0 disables scaling.
    pub loss_scale: f64,
    pub max_grad_norm: f64,
    pub exp_name: Option<String>,
    pub from_pretrained: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
    pub model_config_file: Option<PathBuf>,
    pub vocab_file: Option<PathBuf>,
    pub tokenizer: TokenizerKind,
    pub no_cuda: bool,
    pub seed: u64,
    pub local_rank: i64,
    pub num_workers: usize,
    pub debug: bool,
    pub no_eval: bool,
    pub save_freq: SaveFreq,
    /// Epochs without validation improvement before stopping; negative disables.
    pub patience: i64,
    pub resume_from_checkpoint: bool,
}

impl TrainParams {
    pub const FIELDS: &'static [&'static str] = &[
        "model_type",
        "task",
        "learning_rate",
        "batch_size",
        "num_train_epochs",
        "num_log_iter",
        "fp16",
        "warmup_steps",
        "gradient_accumulation_steps",
        "loss_scale",
        "max_grad_norm",
        "exp_name",
        "from_pretrained",
        "log_dir",
        "output_dir",
        "data_dir",
        "model_config_file",
        "vocab_file",
        "tokenizer",
        "no_cuda",
        "seed",
        "local_rank",
        "num_workers",
        "debug",
        "no_eval",
        "save_freq",
        "patience",
        "resume_from_checkpoint",
    ];

    pub fn is_distributed(&self) -> bool {
        self.local_rank != -1
    }

    /// The given experiment name, or a fresh one.
    pub fn resolved_exp_name(&self) -> String {
        self.exp_name
            .clone()
            .unwrap_or_else(|| default_exp_name(&self.task, &self.model_type))
    }
}

/// `{task}_{model_type}_{yy-mm-dd-HH-MM-SS}_{NNNNNN}`
pub fn default_exp_name(task: &str, model_type: &str) -> String {
    let time_stamp = chrono::Local::now().format("%y-%m-%d-%H-%M-%S");
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}_{}_{}_{:06}", task, model_type, time_stamp, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_freq_parses_integers_and_sentinel() {
        assert_eq!("3".parse::<SaveFreq>().unwrap(), SaveFreq::Every(3));
        assert_eq!(
            "improvement".parse::<SaveFreq>().unwrap(),
            SaveFreq::Improvement
        );
        assert!("0".parse::<SaveFreq>().is_err());
        assert!("-2".parse::<SaveFreq>().is_err());
        assert!("best".parse::<SaveFreq>().is_err());
    }

    #[test]
    fn save_freq_json_form_matches_the_flag() {
        assert_eq!(serde_json::to_value(SaveFreq::Every(2)).unwrap(), json!(2));
        assert_eq!(
            serde_json::from_value::<SaveFreq>(json!("improvement")).unwrap(),
            SaveFreq::Improvement
        );
        assert!(serde_json::from_value::<SaveFreq>(json!(0)).is_err());
    }

    #[test]
    fn generated_names_carry_task_and_model() {
        let name = default_exp_name("stability", "lstm");
        assert!(name.starts_with("stability_lstm_"));
        let suffix = name.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 6);
    }
}
