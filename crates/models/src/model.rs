use anyhow::{bail, Result};
use std::path::Path;
use tch::nn::{self, Module, RNN};
use tch::{Kind, Reduction, Tensor};

use tape_core::batch::{IGNORE_INDEX, INPUT_IDS, INPUT_MASK, TARGETS};
use tape_core::{Batch, ModelOutput, ModelSpec, TaskModel};

use crate::config::ModelConfig;
use crate::safetensors_util::{load_safetensors, save_safetensors, WEIGHTS_NAME};

/// Supervision shape of a task, which decides the head put on the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Embed,
    Regression,
    Classification,
    TokenPrediction,
}

impl TaskKind {
    pub fn for_task(task: &str) -> Result<Self> {
        match task {
            "embed" => Ok(Self::Embed),
            "fluorescence" | "stability" => Ok(Self::Regression),
            "remote_homology" => Ok(Self::Classification),
            "masked_language_modeling" => Ok(Self::TokenPrediction),
            other => bail!("no task head for task '{}'", other),
        }
    }
}

enum Encoder {
    OneHot {
        vocab_size: i64,
    },
    Lstm {
        embedding: nn::Embedding,
        lstm: nn::LSTM,
    },
}

impl Encoder {
    fn new(model_type: &str, vs: &nn::Path, config: &ModelConfig) -> Result<Self> {
        match model_type {
            "onehot" => Ok(Self::OneHot {
                vocab_size: config.vocab_size,
            }),
            "lstm" => {
                let embedding = nn::embedding(
                    vs / "embedding",
                    config.vocab_size,
                    config.hidden_size,
                    Default::default(),
                );
                let rnn_config = nn::RNNConfig {
                    num_layers: config.num_layers,
                    bidirectional: true,
                    batch_first: true,
                    ..Default::default()
                };
                let lstm = nn::lstm(vs / "lstm", config.hidden_size, config.hidden_size, rnn_config);
                Ok(Self::Lstm { embedding, lstm })
            }
            other => bail!("unknown model family '{}'", other),
        }
    }

    fn output_size(&self, config: &ModelConfig) -> i64 {
        match self {
            Self::OneHot { vocab_size } => *vocab_size,
            Self::Lstm { .. } => 2 * config.hidden_size,
        }
    }

    /// Returns `[batch, len, features]` per-position features.
    fn forward(&self, input_ids: &Tensor) -> Tensor {
        match self {
            Self::OneHot { vocab_size } => input_ids.one_hot(*vocab_size).to_kind(Kind::Float),
            Self::Lstm { embedding, lstm } => {
                let embedded = embedding.forward(input_ids);
                let (output, _) = lstm.seq(&embedded);
                output
            }
        }
    }
}

/// Mean over the positions where `mask` is set.
fn masked_mean(sequence: &Tensor, mask: &Tensor) -> Tensor {
    let mask = mask.to_kind(Kind::Float).unsqueeze(-1);
    let summed = (sequence * &mask).sum_dim_intlist(Some(&[1i64][..]), false, Kind::Float);
    let counts = mask
        .sum_dim_intlist(Some(&[1i64][..]), false, Kind::Float)
        .clamp_min(1.0);
    summed / counts
}

/// A sequence encoder of one model family with the head for one task.
pub struct ProteinModel {
    vs: nn::VarStore,
    config: ModelConfig,
    kind: TaskKind,
    encoder: Encoder,
    head: Option<nn::Linear>,
}

impl ProteinModel {
    pub fn new(spec: &ModelSpec) -> Result<Self> {
        let mut config =
            ModelConfig::resolve(spec.config_file.as_deref(), spec.from_pretrained.as_deref())?;
        let vocab_size = spec.vocab_size as i64;
        if config.vocab_size != vocab_size {
            log::debug!(
                "Setting vocab_size to {} to match the tokenizer (config had {})",
                vocab_size,
                config.vocab_size
            );
            config.vocab_size = vocab_size;
        }

        let kind = TaskKind::for_task(&spec.task)?;
        let mut vs = nn::VarStore::new(spec.device);
        let root = vs.root();
        let encoder = Encoder::new(&spec.model_type, &(&root / "encoder"), &config)?;

        let features = encoder.output_size(&config);
        let head_size = match kind {
            TaskKind::Embed => None,
            TaskKind::Regression => Some(1),
            TaskKind::Classification => Some(config.num_labels),
            TaskKind::TokenPrediction => Some(config.vocab_size),
        };
        let head = head_size.map(|out| nn::linear(&root / "head", features, out, Default::default()));

        if let Some(dir) = spec.from_pretrained.as_deref() {
            let weights = dir.join(WEIGHTS_NAME);
            if weights.exists() {
                log::info!("Loading weights from {:?}", weights);
                load_safetensors(&mut vs, &weights)?;
            } else {
                log::warn!("No {} found in {:?}. Using random weights.", WEIGHTS_NAME, dir);
            }
        }

        Ok(Self {
            vs,
            config,
            kind,
            encoder,
            head,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn task_kind(&self) -> TaskKind {
        self.kind
    }

    fn loss(&self, prediction: &Tensor, targets: &Tensor) -> Tensor {
        match self.kind {
            TaskKind::Embed => Tensor::from(0f32).to_device(prediction.device()),
            TaskKind::Regression => prediction.mse_loss(targets, Reduction::Mean),
            TaskKind::Classification => prediction.cross_entropy_for_logits(targets),
            TaskKind::TokenPrediction => {
                let vocab = prediction.size()[2];
                prediction.view([-1, vocab]).cross_entropy_loss::<Tensor>(
                    &targets.view([-1i64]),
                    None,
                    Reduction::Mean,
                    IGNORE_INDEX,
                    0.0,
                )
            }
        }
    }
}

impl TaskModel for ProteinModel {
    fn forward(&self, batch: &Batch, train: bool) -> Result<ModelOutput> {
        let input_ids = batch.require(INPUT_IDS)?;
        let input_mask = batch.require(INPUT_MASK)?;

        let sequence = self
            .encoder
            .forward(input_ids)
            .dropout(self.config.dropout, train);
        let pooled = masked_mean(&sequence, input_mask);

        let logits = match (&self.head, self.kind) {
            (None, _) => pooled.shallow_clone(),
            (Some(head), TaskKind::TokenPrediction) => sequence.apply(head),
            (Some(head), _) => pooled.apply(head),
        };

        let loss = batch.get(TARGETS).map(|targets| self.loss(&logits, targets));

        // Token predictions are reported as ids; the full logits are only
        // needed for the loss.
        let prediction = match self.kind {
            TaskKind::TokenPrediction => logits.argmax(-1, false),
            _ => logits,
        };

        Ok(ModelOutput {
            loss,
            prediction,
            pooled,
        })
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.config.save(dir)?;
        save_safetensors(&self.vs, dir.join(WEIGHTS_NAME))?;
        Ok(())
    }
}
