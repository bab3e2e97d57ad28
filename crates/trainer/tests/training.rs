use std::fs;
use std::path::Path;
use std::sync::Arc;

use datasets::{DataLoader, LoaderOptions};
use tape_core::{DatasetSpec, ModelSpec, Registry, SaveCallback};
use tch::Device;
use tokenizer::{Tokenizer, TokenizerKind};
use trainer::{run_eval_epoch, DataParallel, ForwardRunner, SaveFreq, TrainParams, TrainingState};

fn registry() -> Registry {
    let mut registry = Registry::new();
    models::register(&mut registry).unwrap();
    datasets::register(&mut registry).unwrap();
    trainer::register(&mut registry).unwrap();
    registry
}

fn write_split(data_dir: &Path, split: &str, records: &[(&str, f64)]) {
    let dir = data_dir.join("fluorescence");
    fs::create_dir_all(&dir).unwrap();
    let lines: Vec<String> = records
        .iter()
        .enumerate()
        .map(|(i, (seq, target))| {
            format!(r#"{{"id": "{split}_{i}", "primary": "{seq}", "target": [{target}]}}"#)
        })
        .collect();
    fs::write(dir.join(format!("fluorescence_{split}.jsonl")), lines.join("\n")).unwrap();
}

fn write_fluorescence(data_dir: &Path) {
    let records = [
        ("MKV", 1.0),
        ("MKVLL", 2.0),
        ("GGHH", 0.5),
        ("ACDEFG", 3.0),
        ("KKLL", 1.5),
        ("WYV", 2.5),
    ];
    write_split(data_dir, "train", &records);
    write_split(data_dir, "valid", &records[..3]);
}

fn params(root: &Path, exp_name: &str) -> TrainParams {
    TrainParams {
        model_type: "onehot".to_string(),
        task: "fluorescence".to_string(),
        learning_rate: 1e-2,
        batch_size: 2,
        num_train_epochs: 2,
        num_log_iter: 1,
        fp16: false,
        warmup_steps: 0,
        gradient_accumulation_steps: 1,
        loss_scale: 0.0,
        max_grad_norm: 1.0,
        exp_name: Some(exp_name.to_string()),
        from_pretrained: None,
        log_dir: root.join("logs"),
        output_dir: root.join("results"),
        data_dir: root.join("data"),
        model_config_file: None,
        vocab_file: None,
        tokenizer: TokenizerKind::AminoAcid,
        no_cuda: true,
        seed: 42,
        local_rank: -1,
        num_workers: 2,
        debug: false,
        no_eval: false,
        save_freq: SaveFreq::Every(1),
        patience: -1,
        resume_from_checkpoint: false,
    }
}

#[test]
fn training_writes_a_resumable_checkpoint() {
    let root = tempfile::tempdir().unwrap();
    write_fluorescence(&root.path().join("data"));
    let registry = registry();

    let summary = trainer::run_train(&registry, params(root.path(), "first")).unwrap();
    assert_eq!(summary.epochs_run, 2);
    assert_eq!(summary.global_step, 6);
    assert!(summary.best_val_loss.is_some());

    let save_path = root.path().join("results").join("first");
    assert_eq!(summary.save_path, save_path);
    for name in ["config.json", "pytorch_model.safetensors", "checkpoint.json", "args.json"] {
        assert!(save_path.join(name).exists(), "missing {name}");
    }
    let state = TrainingState::load(&save_path).unwrap();
    assert_eq!(state.epoch, 1);
    assert_eq!(state.global_step, 6);

    let epoch_log =
        fs::read_to_string(root.path().join("logs").join("first").join("metrics.jsonl")).unwrap();
    assert_eq!(epoch_log.lines().count(), 2);

    let resumed = TrainParams {
        num_train_epochs: 3,
        from_pretrained: Some(save_path),
        resume_from_checkpoint: true,
        ..params(root.path(), "second")
    };
    let summary = trainer::run_train(&registry, resumed).unwrap();
    assert_eq!(summary.epochs_run, 1);
    assert_eq!(summary.global_step, 9);
}

#[test]
fn improvement_saving_requires_validation() {
    let root = tempfile::tempdir().unwrap();
    let request = TrainParams {
        no_eval: true,
        save_freq: SaveFreq::Improvement,
        ..params(root.path(), "no_eval")
    };
    let err = trainer::run_train(&registry(), request).unwrap_err();
    assert!(err.to_string().contains("--no-eval"));
    assert!(!root.path().join("results").exists());
}

#[test]
fn patience_stops_training_early() {
    let root = tempfile::tempdir().unwrap();
    write_fluorescence(&root.path().join("data"));
    // Zero learning rate never improves on the first validation loss.
    let request = TrainParams {
        learning_rate: 0.0,
        num_train_epochs: 10,
        patience: 1,
        ..params(root.path(), "patience")
    };
    let summary = trainer::run_train(&registry(), request).unwrap();
    assert_eq!(summary.epochs_run, 3);
}

fn fluorescence_loader(data_dir: &Path, tokenizer: Arc<Tokenizer>) -> DataLoader {
    let dataset = registry()
        .dataset("fluorescence")
        .unwrap()
        .build(&DatasetSpec {
            data_dir: data_dir.to_path_buf(),
            split: "train".to_string(),
            tokenizer: tokenizer.clone(),
            seed: 0,
        })
        .unwrap();
    let options = LoaderOptions {
        batch_size: 4,
        pad_id: tokenizer.pad_id(),
        ..Default::default()
    };
    DataLoader::new(dataset, options).unwrap()
}

fn spec(model_type: &str) -> ModelSpec {
    ModelSpec {
        model_type: model_type.to_string(),
        task: "fluorescence".to_string(),
        config_file: None,
        from_pretrained: None,
        vocab_size: Tokenizer::amino_acid().vocab_size(),
        device: Device::Cpu,
    }
}

#[test]
fn eval_epoch_collects_predictions_in_loader_order() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("data");
    write_fluorescence(&data_dir);
    let registry = registry();
    let loader = fluorescence_loader(&data_dir, Arc::new(Tokenizer::amino_acid()));

    let family = registry.model("onehot", "fluorescence").unwrap();
    let runner = ForwardRunner::build(family, &spec("onehot"), 0).unwrap();
    let callback: &dyn SaveCallback = registry.callback("save_predictions").unwrap();
    let outcome = run_eval_epoch(&loader, &runner, true, &[callback]).unwrap();

    assert!(outcome.loss.is_some());
    assert_eq!(outcome.outputs.len(), 6);
    let targets: Vec<f64> = outcome
        .outputs
        .field("target")
        .unwrap()
        .iter()
        .map(|v| v[0].as_f64().unwrap())
        .collect();
    assert_eq!(targets, vec![1.0, 2.0, 0.5, 3.0, 1.5, 2.5]);
    assert_eq!(outcome.outputs.field("prediction").unwrap().len(), 6);
}

#[test]
fn callbacks_writing_the_same_field_fail_the_pass() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("data");
    write_fluorescence(&data_dir);
    let registry = registry();
    let loader = fluorescence_loader(&data_dir, Arc::new(Tokenizer::amino_acid()));

    let family = registry.model("onehot", "fluorescence").unwrap();
    let runner = ForwardRunner::build(family, &spec("onehot"), 0).unwrap();
    let callback: &dyn SaveCallback = registry.callback("save_predictions").unwrap();
    let err = run_eval_epoch(&loader, &runner, true, &[callback, callback]).unwrap_err();
    assert!(err.to_string().contains("more than one save callback"), "{err}");
}

#[test]
fn replicas_reproduce_the_primary_model() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("data");
    write_fluorescence(&data_dir);
    let registry = registry();
    let loader = fluorescence_loader(&data_dir, Arc::new(Tokenizer::amino_acid()));
    let batch = loader.iter().next().unwrap().unwrap();

    let family = registry.model("lstm", "fluorescence").unwrap();
    let primary = family.build(&spec("lstm")).unwrap();
    let expected = tch::no_grad(|| primary.forward(&batch, false)).unwrap();

    let parallel =
        DataParallel::replicate(primary, family, &spec("lstm"), &[Device::Cpu, Device::Cpu])
            .unwrap();
    assert_eq!(parallel.num_replicas(), 2);
    let output = tch::no_grad(|| parallel.forward(&batch, false)).unwrap();

    assert_eq!(output.prediction.size(), vec![4, 1]);
    let diff = (&output.prediction - &expected.prediction)
        .abs()
        .max()
        .double_value(&[]);
    assert!(diff < 1e-5, "replicated predictions differ by {diff}");
    assert!(output.loss.is_some());
}
