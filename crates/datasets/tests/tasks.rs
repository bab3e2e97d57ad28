use std::fs;
use std::path::Path;
use std::sync::Arc;

use datasets::{DataLoader, LoaderOptions};
use tape_core::batch::TARGETS;
use tape_core::{DatasetSpec, Registry, Target};
use tokenizer::Tokenizer;

fn spec(data_dir: &Path, split: &str) -> DatasetSpec {
    DatasetSpec {
        data_dir: data_dir.to_path_buf(),
        split: split.to_string(),
        tokenizer: Arc::new(Tokenizer::amino_acid()),
        seed: 1,
    }
}

fn write_task(data_dir: &Path, task: &str, split: &str, lines: &[&str]) {
    let dir = data_dir.join(task);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{task}_{split}.jsonl")), lines.join("\n")).unwrap();
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    datasets::register(&mut registry).unwrap();
    registry
}

#[test]
fn regression_split_reads_values() {
    let dir = tempfile::tempdir().unwrap();
    write_task(
        dir.path(),
        "fluorescence",
        "valid",
        &[
            r#"{"id": "gfp_1", "primary": "MSKGEE", "target": [3.2]}"#,
            r#"{"primary": "MSKG", "target": 1.5}"#,
        ],
    );

    let dataset = registry()
        .dataset("fluorescence")
        .unwrap()
        .build(&spec(dir.path(), "valid"))
        .unwrap();
    assert_eq!(dataset.len(), 2);

    let first = dataset.example(0).unwrap();
    assert_eq!(first.id, "gfp_1");
    assert_eq!(first.target, Target::Value(3.2));
    // <cls> + 6 residues + <sep>
    assert_eq!(first.input_ids.len(), 8);

    let second = dataset.example(1).unwrap();
    assert_eq!(second.id, "1");
    assert_eq!(second.target, Target::Value(1.5));
}

#[test]
fn classification_labels_batch_as_integers() {
    let dir = tempfile::tempdir().unwrap();
    write_task(
        dir.path(),
        "remote_homology",
        "train",
        &[
            r#"{"primary": "MKV", "target": 4}"#,
            r#"{"primary": "MKVLL", "target": 0}"#,
            r#"{"primary": "GG", "target": 7}"#,
        ],
    );

    let dataset = registry()
        .dataset("remote_homology")
        .unwrap()
        .build(&spec(dir.path(), "train"))
        .unwrap();
    let options = LoaderOptions {
        batch_size: 3,
        ..Default::default()
    };
    let loader = DataLoader::new(dataset, options).unwrap();
    let batch = loader.iter().next().unwrap().unwrap();

    let targets = batch.require(TARGETS).unwrap();
    assert_eq!(targets.size(), vec![3]);
    assert_eq!(targets.int64_value(&[2]), 7);
}

#[test]
fn non_integer_label_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_task(
        dir.path(),
        "remote_homology",
        "test",
        &[r#"{"primary": "MKV", "target": "fold"}"#],
    );

    let dataset = registry()
        .dataset("remote_homology")
        .unwrap()
        .build(&spec(dir.path(), "test"))
        .unwrap();
    assert!(dataset.example(0).is_err());
}

#[test]
fn embed_reads_the_fasta_file_named_by_split() {
    let dir = tempfile::tempdir().unwrap();
    let fasta = dir.path().join("query.fasta");
    fs::write(&fasta, ">p1\nMKV\n>p2\nGGHH\n").unwrap();

    let dataset = registry()
        .dataset("embed")
        .unwrap()
        .build(&spec(dir.path(), fasta.to_str().unwrap()))
        .unwrap();
    assert_eq!(dataset.len(), 2);
    let second = dataset.example(1).unwrap();
    assert_eq!(second.id, "p2");
    assert_eq!(second.target, Target::None);
}

#[test]
fn missing_split_file_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let err = registry()
        .dataset("stability")
        .unwrap()
        .build(&spec(dir.path(), "train"))
        .err()
        .unwrap();
    assert!(format!("{err:#}").contains("stability_train.jsonl"));
}
