use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tch::nn::{self, OptimizerConfig};
use tch::{Device, Tensor};

use datasets::{effective_batch_size, DataLoader, LoaderOptions, Shard};
use tape_core::{DatasetSpec, ModelSpec, Registry, TaskModel};
use tokenizer::Tokenizer;

use crate::collective::{average_gradients, Collective};
use crate::distributed::{set_random_seeds, setup_distributed, DeviceSetup};
use crate::params::{SaveFreq, TrainParams};
use crate::runner::{progress_bar, run_eval_epoch, ForwardRunner};
use crate::schedule::WarmupLinearSchedule;

pub const CHECKPOINT_STATE_NAME: &str = "checkpoint.json";
pub const ARGS_NAME: &str = "args.json";

/// Batches per pass when `debug` is set.
const DEBUG_BATCHES: usize = 10;

/// Bookkeeping saved beside the weights so a run can be resumed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub global_step: usize,
    pub best_val_loss: Option<f64>,
}

impl TrainingState {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CHECKPOINT_STATE_NAME);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("No training state to resume from at {:?}", path))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::write(
            dir.join(CHECKPOINT_STATE_NAME),
            serde_json::to_string_pretty(self)?,
        )?;
        Ok(())
    }
}

/// What a finished run reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub exp_name: String,
    pub save_path: PathBuf,
    pub epochs_run: usize,
    pub global_step: usize,
    pub best_val_loss: Option<f64>,
}

/// Appends one JSON line per epoch under `log_dir/exp_name/`.
struct EpochLog {
    path: PathBuf,
}

impl EpochLog {
    fn create(log_dir: &Path, exp_name: &str) -> Result<Self> {
        let dir = log_dir.join(exp_name);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("metrics.jsonl"),
        })
    }

    fn record(&self, record: serde_json::Value) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", record)?;
        Ok(())
    }
}

pub struct Trainer {
    params: TrainParams,
    runner: ForwardRunner,
    optimizer: nn::Optimizer,
    schedule: WarmupLinearSchedule,
    collective: Option<Collective>,
    device: Device,
    is_master: bool,
    global_step: usize,
}

impl Trainer {
    pub fn new(
        params: TrainParams,
        model: Box<dyn TaskModel>,
        setup: DeviceSetup,
        total_steps: usize,
    ) -> Result<Self> {
        let optimizer = nn::AdamW::default().build(model.var_store(), params.learning_rate)?;
        let schedule =
            WarmupLinearSchedule::new(params.learning_rate, params.warmup_steps, total_steps);

        log::info!(
            "Trainable parameters: {}",
            model
                .var_store()
                .trainable_variables()
                .iter()
                .map(Tensor::numel)
                .sum::<usize>()
        );

        Ok(Self {
            params,
            runner: ForwardRunner::Single(model),
            optimizer,
            schedule,
            collective: setup.collective,
            device: setup.device,
            is_master: setup.is_master,
            global_step: 0,
        })
    }

    pub fn model(&self) -> &dyn TaskModel {
        self.runner.model()
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    fn loss_scale(&self) -> Option<f64> {
        (self.params.fp16 && self.params.loss_scale > 0.0).then_some(self.params.loss_scale)
    }

    /// Averages gradients over the process group, undoes loss scaling, clips
    /// and applies one optimizer step.
    fn step(&mut self) -> Result<()> {
        if let Some(collective) = self.collective.as_mut() {
            average_gradients(self.runner.model().var_store(), collective)?;
        }
        if let Some(scale) = self.loss_scale() {
            for var in self.runner.model().var_store().trainable_variables() {
                let mut grad = var.grad();
                if grad.defined() {
                    let unscaled = &grad / scale;
                    tch::no_grad(|| grad.copy_(&unscaled));
                }
            }
        }
        if self.params.max_grad_norm > 0.0 {
            self.optimizer.clip_grad_norm(self.params.max_grad_norm);
        }
        self.optimizer.set_lr(self.schedule.lr_at(self.global_step));
        self.optimizer.step();
        self.optimizer.zero_grad();
        self.global_step += 1;
        Ok(())
    }

    pub fn train_epoch(&mut self, loader: &DataLoader, epoch: usize) -> Result<f64> {
        let accumulation = self.params.gradient_accumulation_steps.max(1);
        let num_batches = if self.params.debug {
            loader.len().min(DEBUG_BATCHES)
        } else {
            loader.len()
        };
        let pb = progress_bar(num_batches, self.is_master, &format!("epoch {}", epoch));
        let start = Instant::now();

        let mut total_loss = 0.0;
        let mut window_loss = 0.0;
        let mut window_steps = 0usize;
        self.optimizer.zero_grad();

        for (batch_idx, batch) in loader.iter().take(num_batches).enumerate() {
            let batch = batch?;
            let fp16 = self.params.fp16;
            let runner = &self.runner;
            let output = tch::autocast(fp16, || runner.forward(&batch, true))?;
            let loss = output
                .loss
                .context("Training batches must carry targets")?;

            let loss = loss / accumulation as f64;
            match self.loss_scale() {
                Some(scale) => (&loss * scale).backward(),
                None => loss.backward(),
            }
            let loss_value = loss.double_value(&[]) * accumulation as f64;
            total_loss += loss_value;
            window_loss += loss_value;

            let last = batch_idx + 1 == num_batches;
            if (batch_idx + 1) % accumulation == 0 || last {
                self.step()?;
                window_steps += 1;

                if self.params.num_log_iter > 0 && self.global_step % self.params.num_log_iter == 0 {
                    let batches_in_window = window_steps * accumulation;
                    log::info!(
                        "[Ep: {:.2}][Iter: {}][Time: {:5.2}s][Loss: {:.5}][LR: {:.2e}]",
                        epoch as f64 + (batch_idx + 1) as f64 / num_batches.max(1) as f64,
                        self.global_step,
                        start.elapsed().as_secs_f64(),
                        window_loss / batches_in_window as f64,
                        self.schedule.lr_at(self.global_step),
                    );
                    window_loss = 0.0;
                    window_steps = 0;
                }
            }

            pb.set_message(format!("loss: {:.4}", loss_value));
            pb.inc(1);
        }
        pb.finish_and_clear();

        let mut mean = [(total_loss / num_batches.max(1) as f64) as f32];
        if let Some(collective) = self.collective.as_mut() {
            collective.all_reduce_mean(&mut mean)?;
        }
        Ok(mean[0] as f64)
    }

    pub fn evaluate(&mut self, loader: &DataLoader) -> Result<f64> {
        let outcome = run_eval_epoch(loader, &self.runner, self.is_master, &[])?;
        let loss = outcome
            .loss
            .context("Validation batches must carry targets")?;
        let mut mean = [loss as f32];
        if let Some(collective) = self.collective.as_mut() {
            collective.all_reduce_mean(&mut mean)?;
        }
        Ok(mean[0] as f64)
    }

    pub fn save_checkpoint(&self, save_path: &Path, state: &TrainingState) -> Result<()> {
        if !self.is_master {
            return Ok(());
        }
        self.model().save_pretrained(save_path)?;
        state.save(save_path)?;
        log::info!("Saving model checkpoint to {:?}", save_path);
        Ok(())
    }

    pub fn barrier(&mut self) -> Result<()> {
        match self.collective.as_mut() {
            Some(collective) => collective.barrier(),
            None => Ok(()),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

/// The training workflow: builds every collaborator from the registry, runs
/// the epochs and keeps checkpoints under `output_dir/exp_name`.
pub fn run_train(registry: &Registry, params: TrainParams) -> Result<TrainSummary> {
    if params.no_eval && params.save_freq == SaveFreq::Improvement {
        bail!("--save-freq improvement needs a validation pass; drop --no-eval");
    }

    let setup = setup_distributed(params.local_rank, params.no_cuda)?;
    set_random_seeds(params.seed, setup.n_gpu);
    if setup.n_gpu > 1 {
        log::warn!(
            "{} devices visible; single-process training uses {:?}. Use distributed-train to use all of them.",
            setup.n_gpu,
            setup.device
        );
    }

    let exp_name = params.resolved_exp_name();
    let save_path = params.output_dir.join(&exp_name);
    let epoch_log = if setup.is_master {
        fs::create_dir_all(&save_path)?;
        fs::write(save_path.join(ARGS_NAME), serde_json::to_string_pretty(&params)?)?;
        Some(EpochLog::create(&params.log_dir, &exp_name)?)
    } else {
        None
    };

    let tokenizer = Arc::new(Tokenizer::new(params.tokenizer, params.vocab_file.as_deref())?);
    let model = registry.model(&params.model_type, &params.task)?.build(&ModelSpec {
        model_type: params.model_type.clone(),
        task: params.task.clone(),
        config_file: params.model_config_file.clone(),
        from_pretrained: params.from_pretrained.clone(),
        vocab_size: tokenizer.vocab_size(),
        device: setup.device,
    })?;

    let factory = registry.dataset(&params.task)?;
    let dataset_spec = |split: &str| DatasetSpec {
        data_dir: params.data_dir.clone(),
        split: split.to_string(),
        tokenizer: tokenizer.clone(),
        seed: params.seed,
    };
    let shard = setup.collective.as_ref().map(|c| Shard {
        rank: c.rank(),
        world_size: c.world_size(),
    });
    // Training runs on one device per process.
    let batch_size = effective_batch_size(
        params.batch_size,
        setup.world_size(),
        1,
        params.gradient_accumulation_steps,
    );
    let loader_options = |shuffle: bool| LoaderOptions {
        batch_size,
        shuffle,
        seed: params.seed,
        pad_id: tokenizer.pad_id(),
        num_workers: params.num_workers,
        shard,
    };

    let mut train_loader =
        DataLoader::new(factory.build(&dataset_spec("train"))?, loader_options(true))?;
    let valid_loader = if params.no_eval {
        None
    } else {
        Some(DataLoader::new(
            factory.build(&dataset_spec("valid"))?,
            loader_options(false),
        )?)
    };

    let steps_per_epoch = train_loader
        .len()
        .div_ceil(params.gradient_accumulation_steps.max(1));
    let total_steps = steps_per_epoch * params.num_train_epochs;

    let mut state = TrainingState::default();
    let mut start_epoch = 0;
    if params.resume_from_checkpoint {
        let dir = params
            .from_pretrained
            .as_deref()
            .context("--resume-from-checkpoint needs --from-pretrained")?;
        state = TrainingState::load(dir)?;
        start_epoch = state.epoch + 1;
        log::info!("Resuming from epoch {} (step {})", start_epoch, state.global_step);
    }

    log::info!("***** Running training *****");
    log::info!("  Num examples = {}", train_loader.num_examples());
    log::info!("  Batch size per process = {}", batch_size);
    log::info!("  Num epochs = {}", params.num_train_epochs);
    log::info!("  Total optimization steps = {}", total_steps);

    let save_freq = params.save_freq;
    let patience = params.patience;
    let num_train_epochs = params.num_train_epochs;
    let mut trainer = Trainer::new(params, model, setup, total_steps)?;
    trainer.global_step = state.global_step;

    let mut epochs_without_improvement = 0i64;
    let mut epochs_run = 0;
    for epoch in start_epoch..num_train_epochs {
        train_loader.set_epoch(epoch as u64);
        let train_loss = trainer.train_epoch(&train_loader, epoch)?;
        log::info!("Epoch {} train loss: {:.4}", epoch, train_loss);
        epochs_run += 1;

        let val_loss = match &valid_loader {
            Some(loader) => {
                let loss = trainer.evaluate(loader)?;
                log::info!("Epoch {} validation loss: {:.4}", epoch, loss);
                Some(loss)
            }
            None => None,
        };

        if let Some(log) = &epoch_log {
            log.record(serde_json::json!({
                "epoch": epoch,
                "global_step": trainer.global_step(),
                "train_loss": train_loss,
                "val_loss": val_loss,
            }))?;
        }

        let improved = match (val_loss, state.best_val_loss) {
            (Some(loss), Some(best)) => loss < best,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if improved {
            state.best_val_loss = val_loss;
            epochs_without_improvement = 0;
        } else if val_loss.is_some() {
            epochs_without_improvement += 1;
        }
        state.epoch = epoch;
        state.global_step = trainer.global_step();

        let save = match save_freq {
            SaveFreq::Every(n) => (epoch + 1) % n == 0,
            SaveFreq::Improvement => improved,
        };
        if save {
            trainer.save_checkpoint(&save_path, &state)?;
        }
        trainer.barrier()?;

        if patience >= 0 && epochs_without_improvement > patience {
            log::info!(
                "No improvement for {} epochs, stopping early",
                epochs_without_improvement
            );
            break;
        }
    }
    log::info!("Finished training after {} epochs.", epochs_run);

    Ok(TrainSummary {
        exp_name,
        save_path,
        epochs_run,
        global_step: trainer.global_step(),
        best_val_loss: state.best_val_loss,
    })
}
