use anyhow::Result;
use serde_json::Value;

use tape_core::batch::TARGETS;
use tape_core::{tensor_to_values, Batch, FieldValues, ModelOutput, TaskModel};

/// Targets and predictions under the model's own field names.
pub fn save_predictions(
    model: &dyn TaskModel,
    batch: &Batch,
    outputs: &ModelOutput,
) -> Result<FieldValues> {
    let targets = tensor_to_values(batch.require(TARGETS)?)?;
    let predictions = tensor_to_values(&outputs.prediction)?;

    let mut fields = FieldValues::new();
    fields.insert(model.target_key().to_string(), targets);
    fields.insert(model.prediction_key().to_string(), predictions);
    Ok(fields)
}

/// Example ids and pooled sequence embeddings.
pub fn save_embedding(
    _model: &dyn TaskModel,
    batch: &Batch,
    outputs: &ModelOutput,
) -> Result<FieldValues> {
    let ids = batch.ids.iter().cloned().map(Value::String).collect();
    let embeddings = tensor_to_values(&outputs.pooled)?;

    let mut fields = FieldValues::new();
    fields.insert("id".to_string(), ids);
    fields.insert("embedding".to_string(), embeddings);
    Ok(fields)
}
