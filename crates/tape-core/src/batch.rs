use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use tch::{Device, Kind, Tensor};

pub const INPUT_IDS: &str = "input_ids";
pub const INPUT_MASK: &str = "input_mask";
pub const TARGETS: &str = "targets";

/// Label used in token-level targets for positions that carry no loss.
pub const IGNORE_INDEX: i64 = -1;

/// Supervision attached to one example.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    None,
    Value(f64),
    Label(i64),
    /// One label per input position, `IGNORE_INDEX` where no loss applies.
    Tokens(Vec<i64>),
}

/// One tokenized sequence as produced by a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub id: String,
    pub input_ids: Vec<i64>,
    pub target: Target,
}

/// A padded batch of examples. Tensor rows follow the order of `ids`.
#[derive(Debug)]
pub struct Batch {
    pub ids: Vec<String>,
    pub tensors: BTreeMap<String, Tensor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&Tensor> {
        self.tensors
            .get(key)
            .with_context(|| format!("batch has no '{}' tensor", key))
    }

    pub fn to_device(&self, device: Device, non_blocking: bool) -> Batch {
        let tensors = self
            .tensors
            .iter()
            .map(|(name, t)| {
                let moved = t.to_device_(device, t.kind(), non_blocking, false);
                (name.clone(), moved)
            })
            .collect();
        Batch {
            ids: self.ids.clone(),
            tensors,
        }
    }

    /// Splits the batch along the example dimension into consecutive pieces of
    /// the given sizes.
    pub fn split(&self, sizes: &[usize]) -> Result<Vec<Batch>> {
        let total: usize = sizes.iter().sum();
        if total != self.len() {
            bail!("split sizes sum to {} for a batch of {}", total, self.len());
        }

        let mut start = 0;
        let mut pieces = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let tensors = self
                .tensors
                .iter()
                .map(|(name, t)| (name.clone(), t.narrow(0, start as i64, size as i64)))
                .collect();
            pieces.push(Batch {
                ids: self.ids[start..start + size].to_vec(),
                tensors,
            });
            start += size;
        }
        Ok(pieces)
    }
}

/// What a task model returns for one batch.
#[derive(Debug)]
pub struct ModelOutput {
    /// Mean loss over the batch; absent when the batch has no targets.
    pub loss: Option<Tensor>,
    /// Task prediction, first dimension is the example.
    pub prediction: Tensor,
    /// Pooled sequence representation, `[batch, hidden]`.
    pub pooled: Tensor,
}

/// Pads examples into a batch. Every example must carry the same kind of target.
pub fn collate(examples: Vec<Example>, pad_id: i64) -> Result<Batch> {
    let batch_size = examples.len();
    let max_len = examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0);

    let mut input_ids = Vec::with_capacity(batch_size * max_len);
    let mut input_mask = Vec::with_capacity(batch_size * max_len);
    for example in &examples {
        let pad = max_len - example.input_ids.len();
        input_ids.extend_from_slice(&example.input_ids);
        input_ids.extend(std::iter::repeat(pad_id).take(pad));
        input_mask.extend(std::iter::repeat(1i64).take(example.input_ids.len()));
        input_mask.extend(std::iter::repeat(0i64).take(pad));
    }

    let shape = [batch_size as i64, max_len as i64];
    let mut tensors = BTreeMap::new();
    tensors.insert(INPUT_IDS.to_string(), Tensor::from_slice(&input_ids).view(shape));
    tensors.insert(INPUT_MASK.to_string(), Tensor::from_slice(&input_mask).view(shape));

    if let Some(targets) = collate_targets(&examples, max_len)? {
        tensors.insert(TARGETS.to_string(), targets);
    }

    Ok(Batch {
        ids: examples.into_iter().map(|e| e.id).collect(),
        tensors,
    })
}

fn collate_targets(examples: &[Example], max_len: usize) -> Result<Option<Tensor>> {
    let first = match examples.first() {
        Some(example) => &example.target,
        None => return Ok(None),
    };
    let batch_size = examples.len() as i64;

    let mismatch = |example: &Example| {
        anyhow::anyhow!(
            "example '{}' has a different target kind than '{}'",
            example.id,
            examples[0].id
        )
    };

    let tensor = match first {
        Target::None => {
            if let Some(other) = examples.iter().find(|e| e.target != Target::None) {
                return Err(mismatch(other));
            }
            return Ok(None);
        }
        Target::Value(_) => {
            let mut values = Vec::with_capacity(examples.len());
            for example in examples {
                match example.target {
                    Target::Value(v) => values.push(v as f32),
                    _ => return Err(mismatch(example)),
                }
            }
            Tensor::from_slice(&values).view([batch_size, 1])
        }
        Target::Label(_) => {
            let mut labels = Vec::with_capacity(examples.len());
            for example in examples {
                match example.target {
                    Target::Label(l) => labels.push(l),
                    _ => return Err(mismatch(example)),
                }
            }
            Tensor::from_slice(&labels)
        }
        Target::Tokens(_) => {
            let mut labels = Vec::with_capacity(examples.len() * max_len);
            for example in examples {
                match &example.target {
                    Target::Tokens(tokens) if tokens.len() == example.input_ids.len() => {
                        labels.extend_from_slice(tokens);
                        labels.extend(std::iter::repeat(IGNORE_INDEX).take(max_len - tokens.len()));
                    }
                    Target::Tokens(tokens) => bail!(
                        "example '{}' has {} token targets for {} inputs",
                        example.id,
                        tokens.len(),
                        example.input_ids.len()
                    ),
                    _ => return Err(mismatch(example)),
                }
            }
            Tensor::from_slice(&labels).view([batch_size, max_len as i64])
        }
    };
    Ok(Some(tensor))
}

/// Converts a tensor into one JSON value per row of its first dimension.
/// Scalar rows become numbers, anything larger a flat array.
pub fn tensor_to_values(tensor: &Tensor) -> Result<Vec<Value>> {
    let integral = matches!(
        tensor.kind(),
        Kind::Int64 | Kind::Int | Kind::Int16 | Kind::Int8 | Kind::Uint8 | Kind::Bool
    );
    let kind = if integral { Kind::Int64 } else { Kind::Double };
    let cpu = tensor.detach().to_device(Device::Cpu).to_kind(kind);

    let rows = match cpu.size().first() {
        Some(&rows) => rows,
        None => bail!("cannot split a 0-dimensional tensor into per-example values"),
    };

    let mut values = Vec::with_capacity(rows as usize);
    for i in 0..rows {
        let row = cpu.get(i);
        let value = match (row.dim(), integral) {
            (0, true) => Value::from(row.int64_value(&[])),
            (0, false) => Value::from(row.double_value(&[])),
            (_, true) => Value::from(Vec::<i64>::try_from(&row.flatten(0, -1))?),
            (_, false) => Value::from(Vec::<f64>::try_from(&row.flatten(0, -1))?),
        };
        values.push(value);
    }
    Ok(values)
}
