use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizer::Tokenizer;

use tape_core::batch::IGNORE_INDEX;
use tape_core::{DatasetSpec, Example, Target, TaskDataset};

/// Probability that a residue is selected for the masked language model loss.
const MASK_PROBABILITY: f64 = 0.15;

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub primary: String,
    #[serde(default)]
    pub target: Option<Value>,
}

/// `{data_dir}/{task}/{task}_{split}.jsonl`
pub fn split_path(data_dir: &Path, task: &str, split: &str) -> PathBuf {
    data_dir.join(task).join(format!("{}_{}.jsonl", task, split))
}

pub fn read_jsonl(path: &Path) -> Result<Vec<SequenceRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open dataset {:?}", path))?;
    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("{:?}:{}: malformed record", path, line_no + 1))?;
        records.push(record);
    }
    Ok(records)
}

fn record_id(record: &SequenceRecord, index: usize) -> String {
    record.id.clone().unwrap_or_else(|| index.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Value,
    Label,
}

/// A supervised task stored as JSON lines with `primary` and `target` fields.
pub struct JsonlDataset {
    records: Vec<SequenceRecord>,
    tokenizer: Arc<Tokenizer>,
    kind: TargetKind,
}

impl JsonlDataset {
    pub fn open(path: &Path, tokenizer: Arc<Tokenizer>, kind: TargetKind) -> Result<Self> {
        let records = read_jsonl(path)?;
        log::debug!("Read {} records from {:?}", records.len(), path);
        Ok(Self {
            records,
            tokenizer,
            kind,
        })
    }

    fn target(&self, record: &SequenceRecord, id: &str) -> Result<Target> {
        let value = match &record.target {
            Some(value) => value,
            None => bail!("record '{}' has no target", id),
        };
        // Regression targets are sometimes stored as one-element lists.
        let scalar = match value {
            Value::Array(items) if items.len() == 1 => &items[0],
            other => other,
        };
        match self.kind {
            TargetKind::Value => scalar
                .as_f64()
                .map(Target::Value)
                .with_context(|| format!("record '{}' has non-numeric target {}", id, value)),
            TargetKind::Label => scalar
                .as_i64()
                .map(Target::Label)
                .with_context(|| format!("record '{}' has non-integer label {}", id, value)),
        }
    }
}

impl TaskDataset for JsonlDataset {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn example(&self, index: usize) -> Result<Example> {
        let record = &self.records[index];
        let id = record_id(record, index);
        let target = self.target(record, &id)?;
        Ok(Example {
            input_ids: self.tokenizer.encode(&record.primary),
            id,
            target,
        })
    }
}

/// Unlabeled sequences with BERT-style corruption: of the selected residues
/// 80% become `<mask>`, 10% a random token, 10% stay unchanged.
pub struct MaskedLanguageModelingDataset {
    records: Vec<SequenceRecord>,
    tokenizer: Arc<Tokenizer>,
    seed: u64,
}

impl MaskedLanguageModelingDataset {
    pub fn open(path: &Path, tokenizer: Arc<Tokenizer>, seed: u64) -> Result<Self> {
        Ok(Self {
            records: read_jsonl(path)?,
            tokenizer,
            seed,
        })
    }

    fn corrupt(&self, tokens: &mut [i64], rng: &mut StdRng) -> Vec<i64> {
        let vocab_size = self.tokenizer.vocab_size() as i64;
        let mut labels = vec![IGNORE_INDEX; tokens.len()];
        for (token, label) in tokens.iter_mut().zip(labels.iter_mut()) {
            if self.tokenizer.is_special(*token) || !rng.gen_bool(MASK_PROBABILITY) {
                continue;
            }
            *label = *token;
            let roll: f64 = rng.gen();
            if roll < 0.8 {
                *token = self.tokenizer.mask_id();
            } else if roll < 0.9 {
                *token = rng.gen_range(0..vocab_size);
            }
        }
        labels
    }
}

impl TaskDataset for MaskedLanguageModelingDataset {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn example(&self, index: usize) -> Result<Example> {
        let record = &self.records[index];
        let mut input_ids = self.tokenizer.encode(&record.primary);
        // Seeded per example so every worker thread masks identically.
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let labels = self.corrupt(&mut input_ids, &mut rng);
        Ok(Example {
            id: record_id(record, index),
            input_ids,
            target: Target::Tokens(labels),
        })
    }
}

/// Sequences to embed, read from a FASTA file.
pub struct FastaDataset {
    entries: Vec<(String, String)>,
    tokenizer: Arc<Tokenizer>,
}

impl FastaDataset {
    pub fn open(path: &Path, tokenizer: Arc<Tokenizer>) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let entries = parse_fasta(BufReader::new(file))
            .with_context(|| format!("Failed to parse FASTA file {:?}", path))?;
        Ok(Self { entries, tokenizer })
    }
}

/// Parses `>id description` headers followed by one or more sequence lines.
pub fn parse_fasta<R: BufRead>(reader: R) -> Result<Vec<(String, String)>> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            let id = header.split_whitespace().next().unwrap_or_default();
            entries.push((id.to_string(), String::new()));
        } else {
            match entries.last_mut() {
                Some((_, sequence)) => sequence.push_str(line),
                None => bail!("sequence data before the first '>' header"),
            }
        }
    }
    Ok(entries)
}

impl TaskDataset for FastaDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn example(&self, index: usize) -> Result<Example> {
        let (id, sequence) = &self.entries[index];
        Ok(Example {
            id: id.clone(),
            input_ids: self.tokenizer.encode(sequence),
            target: Target::None,
        })
    }
}

pub fn embed(spec: &DatasetSpec) -> Result<Box<dyn TaskDataset>> {
    let dataset = FastaDataset::open(Path::new(&spec.split), spec.tokenizer.clone())?;
    Ok(Box::new(dataset))
}

pub fn masked_language_modeling(spec: &DatasetSpec) -> Result<Box<dyn TaskDataset>> {
    let path = split_path(&spec.data_dir, "masked_language_modeling", &spec.split);
    let dataset = MaskedLanguageModelingDataset::open(&path, spec.tokenizer.clone(), spec.seed)?;
    Ok(Box::new(dataset))
}

pub fn fluorescence(spec: &DatasetSpec) -> Result<Box<dyn TaskDataset>> {
    let path = split_path(&spec.data_dir, "fluorescence", &spec.split);
    Ok(Box::new(JsonlDataset::open(&path, spec.tokenizer.clone(), TargetKind::Value)?))
}

pub fn stability(spec: &DatasetSpec) -> Result<Box<dyn TaskDataset>> {
    let path = split_path(&spec.data_dir, "stability", &spec.split);
    Ok(Box::new(JsonlDataset::open(&path, spec.tokenizer.clone(), TargetKind::Value)?))
}

pub fn remote_homology(spec: &DatasetSpec) -> Result<Box<dyn TaskDataset>> {
    let path = split_path(&spec.data_dir, "remote_homology", &spec.split);
    Ok(Box::new(JsonlDataset::open(&path, spec.tokenizer.clone(), TargetKind::Label)?))
}
