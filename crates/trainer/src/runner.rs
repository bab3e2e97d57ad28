use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tch::Device;

use datasets::DataLoader;
use tape_core::{Batch, ModelFamily, ModelOutput, ModelSpec, SaveCallback, SaveOutputs, TaskModel};

use crate::parallel::DataParallel;

/// A bar on the master process, a hidden one elsewhere.
pub fn progress_bar(len: usize, is_master: bool, prefix: &str) -> ProgressBar {
    if !is_master {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb
}

/// Runs a model on batches, on one device or replicated over several.
pub enum ForwardRunner {
    Single(Box<dyn TaskModel>),
    Parallel(DataParallel),
}

impl ForwardRunner {
    /// Builds the model for `spec`, replicated when `n_gpu > 1`.
    pub fn build(family: &dyn ModelFamily, spec: &ModelSpec, n_gpu: usize) -> Result<Self> {
        let model = family.build(spec)?;
        if n_gpu > 1 {
            let devices: Vec<Device> = (0..n_gpu).map(Device::Cuda).collect();
            let parallel = DataParallel::replicate(model, family, spec, &devices)?;
            return Ok(Self::Parallel(parallel));
        }
        Ok(Self::Single(model))
    }

    pub fn model(&self) -> &dyn TaskModel {
        match self {
            Self::Single(model) => model.as_ref(),
            Self::Parallel(parallel) => parallel.primary(),
        }
    }

    pub fn device(&self) -> Device {
        self.model().device()
    }

    pub fn forward(&self, batch: &Batch, train: bool) -> Result<ModelOutput> {
        match self {
            Self::Single(model) => model.forward(&batch.to_device(model.device(), true), train),
            Self::Parallel(parallel) => parallel.forward(batch, train),
        }
    }
}

/// Result of one pass without gradient updates.
#[derive(Debug)]
pub struct EvalOutcome {
    /// Mean batch loss, when the batches carried targets.
    pub loss: Option<f64>,
    pub outputs: SaveOutputs,
}

/// One full pass over `loader` with gradients off, feeding every batch through
/// the callbacks. Fields accumulate in loader order.
pub fn run_eval_epoch(
    loader: &DataLoader,
    runner: &ForwardRunner,
    is_master: bool,
    callbacks: &[&dyn SaveCallback],
) -> Result<EvalOutcome> {
    let _guard = tch::no_grad_guard();
    let pb = progress_bar(loader.len(), is_master, "eval");

    let mut outputs = SaveOutputs::new();
    let mut loss_sum = 0.0;
    let mut loss_batches = 0usize;

    for batch in loader.iter() {
        let batch = batch?;
        let output = runner.forward(&batch, false)?;
        if let Some(loss) = &output.loss {
            loss_sum += loss.double_value(&[]);
            loss_batches += 1;
        }

        let mut fields = tape_core::FieldValues::new();
        for callback in callbacks {
            let produced = callback.save(runner.model(), &batch, &output)?;
            tape_core::merge_fields(&mut fields, produced)?;
        }
        if !fields.is_empty() {
            outputs
                .extend(fields)
                .context("Save callbacks produced inconsistent fields")?;
        }

        if let Some(loss) = &output.loss {
            pb.set_message(format!("loss: {:.4}", loss.double_value(&[])));
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let loss = (loss_batches > 0).then(|| loss_sum / loss_batches as f64);
    Ok(EvalOutcome { loss, outputs })
}
