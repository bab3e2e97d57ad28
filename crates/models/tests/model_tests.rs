use std::collections::BTreeMap;

use models::{ModelConfig, ProteinModel, TaskKind};
use tape_core::batch::TARGETS;
use tape_core::{collate, Example, ModelSpec, Registry, Target, TaskModel};
use tch::Device;

fn spec(model_type: &str, task: &str) -> ModelSpec {
    ModelSpec {
        model_type: model_type.to_string(),
        task: task.to_string(),
        config_file: None,
        from_pretrained: None,
        vocab_size: 30,
        device: Device::Cpu,
    }
}

fn small_config_file(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("small.json");
    let config = ModelConfig {
        hidden_size: 8,
        num_layers: 1,
        num_labels: 4,
        dropout: 0.0,
        ..ModelConfig::default()
    };
    std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
    path
}

fn batch(target: fn(usize) -> Target) -> tape_core::Batch {
    let examples = (0..3)
        .map(|i| Example {
            id: format!("seq{i}"),
            input_ids: vec![2, 5 + i as i64, 6, 3],
            target: target(i),
        })
        .collect();
    collate(examples, 0).unwrap()
}

#[test]
fn regression_head_predicts_one_value_per_example() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = spec("lstm", "fluorescence");
    spec.config_file = Some(small_config_file(dir.path()));

    let model = ProteinModel::new(&spec).unwrap();
    assert_eq!(model.task_kind(), TaskKind::Regression);

    let output = model
        .forward(&batch(|i| Target::Value(i as f64)), false)
        .unwrap();
    assert_eq!(output.prediction.size(), vec![3, 1]);
    assert_eq!(output.pooled.size(), vec![3, 16]);
    assert!(output.loss.is_some());
}

#[test]
fn onehot_embedding_has_no_loss_without_targets() {
    let model = ProteinModel::new(&spec("onehot", "embed")).unwrap();
    let output = model.forward(&batch(|_| Target::None), false).unwrap();

    assert!(output.loss.is_none());
    assert_eq!(output.prediction.size(), vec![3, 30]);
}

#[test]
fn token_predictions_are_ids() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = spec("lstm", "masked_language_modeling");
    spec.config_file = Some(small_config_file(dir.path()));

    let model = ProteinModel::new(&spec).unwrap();
    let input = batch(|_| Target::Tokens(vec![-1, 7, -1, -1]));
    assert!(input.get(TARGETS).is_some());

    let output = model.forward(&input, true).unwrap();
    assert_eq!(output.prediction.size(), vec![3, 4]);
    assert!(output.loss.unwrap().double_value(&[]) > 0.0);
}

#[test]
fn pretrained_weights_roundtrip_through_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = spec("lstm", "remote_homology");
    first.config_file = Some(small_config_file(dir.path()));
    let model = ProteinModel::new(&first).unwrap();

    let saved = dir.path().join("pretrained");
    model.save_pretrained(&saved).unwrap();
    assert!(saved.join("config.json").exists());

    let mut second = spec("lstm", "remote_homology");
    second.from_pretrained = Some(saved);
    let reloaded = ProteinModel::new(&second).unwrap();
    assert_eq!(reloaded.config().hidden_size, 8);

    let before: BTreeMap<String, f64> = model
        .var_store()
        .variables()
        .into_iter()
        .map(|(name, t)| (name, t.sum(tch::Kind::Double).double_value(&[])))
        .collect();
    let after: BTreeMap<String, f64> = reloaded
        .var_store()
        .variables()
        .into_iter()
        .map(|(name, t)| (name, t.sum(tch::Kind::Double).double_value(&[])))
        .collect();
    assert_eq!(before, after);
}

#[test]
fn onehot_has_no_language_model_head() {
    let mut registry = Registry::new();
    models::register(&mut registry).unwrap();

    assert!(registry.model("lstm", "masked_language_modeling").is_ok());
    assert!(registry.model("onehot", "masked_language_modeling").is_err());
    assert_eq!(registry.model_types(), vec!["lstm", "onehot"]);
}
