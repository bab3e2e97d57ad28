//! The extension points the orchestration layer consumes. Implementations
//! live outside this crate and are reached through the [`Registry`].
//!
//! [`Registry`]: crate::Registry

use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::{nn, Device};
use tokenizer::Tokenizer;

use crate::batch::{Batch, Example, ModelOutput};

/// Per-example values keyed by output field, as returned by a save callback.
pub type FieldValues = BTreeMap<String, Vec<Value>>;

pub trait TaskModel {
    fn forward(&self, batch: &Batch, train: bool) -> Result<ModelOutput>;

    /// Output field under which `save_predictions` stores targets.
    fn target_key(&self) -> &str {
        "target"
    }

    /// Output field under which `save_predictions` stores predictions.
    fn prediction_key(&self) -> &str {
        "prediction"
    }

    fn var_store(&self) -> &nn::VarStore;

    fn device(&self) -> Device {
        self.var_store().device()
    }

    /// Writes the model config and weights so the directory can be passed back
    /// as a pretrained model.
    fn save_pretrained(&self, dir: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub model_type: String,
    pub task: String,
    pub config_file: Option<PathBuf>,
    pub from_pretrained: Option<PathBuf>,
    pub vocab_size: usize,
    pub device: Device,
}

pub trait ModelFamily: Send + Sync {
    fn build(&self, spec: &ModelSpec) -> Result<Box<dyn TaskModel>>;
}

impl<F> ModelFamily for F
where
    F: Fn(&ModelSpec) -> Result<Box<dyn TaskModel>> + Send + Sync,
{
    fn build(&self, spec: &ModelSpec) -> Result<Box<dyn TaskModel>> {
        self(spec)
    }
}

pub trait TaskDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn example(&self, index: usize) -> Result<Example>;
}

#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub data_dir: PathBuf,
    /// Split name, or the input file itself for the `embed` task.
    pub split: String,
    pub tokenizer: Arc<Tokenizer>,
    pub seed: u64,
}

pub trait DatasetFactory: Send + Sync {
    fn build(&self, spec: &DatasetSpec) -> Result<Box<dyn TaskDataset>>;
}

impl<F> DatasetFactory for F
where
    F: Fn(&DatasetSpec) -> Result<Box<dyn TaskDataset>> + Send + Sync,
{
    fn build(&self, spec: &DatasetSpec) -> Result<Box<dyn TaskDataset>> {
        self(spec)
    }
}

pub trait Metric: Send + Sync {
    fn compute(&self, targets: &[Value], predictions: &[Value]) -> Result<f64>;
}

impl<F> Metric for F
where
    F: Fn(&[Value], &[Value]) -> Result<f64> + Send + Sync,
{
    fn compute(&self, targets: &[Value], predictions: &[Value]) -> Result<f64> {
        self(targets, predictions)
    }
}

pub trait SaveCallback: Send + Sync {
    fn save(&self, model: &dyn TaskModel, batch: &Batch, outputs: &ModelOutput)
        -> Result<FieldValues>;
}

impl<F> SaveCallback for F
where
    F: Fn(&dyn TaskModel, &Batch, &ModelOutput) -> Result<FieldValues> + Send + Sync,
{
    fn save(
        &self,
        model: &dyn TaskModel,
        batch: &Batch,
        outputs: &ModelOutput,
    ) -> Result<FieldValues> {
        self(model, batch, outputs)
    }
}
