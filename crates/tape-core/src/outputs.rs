use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::capability::FieldValues;
use crate::error::OutputsError;

/// Adds the fields one callback produced for a batch to those of the
/// callbacks before it. Nothing is added if any field name is taken.
pub fn merge_fields(into: &mut FieldValues, from: FieldValues) -> Result<(), OutputsError> {
    if let Some(taken) = from.keys().find(|k| into.contains_key(*k)) {
        return Err(OutputsError::DuplicateField(taken.clone()));
    }
    into.extend(from);
    Ok(())
}

/// Per-example outputs accumulated over a pass, in dataset iteration order.
///
/// Every field holds exactly one value per example seen so far. Metrics are
/// kept beside the fields and serialized into the same flat object.
#[derive(Debug, Default, Serialize)]
pub struct SaveOutputs {
    #[serde(flatten)]
    fields: BTreeMap<String, Vec<Value>>,
    #[serde(flatten)]
    metrics: BTreeMap<String, f64>,
    #[serde(skip)]
    examples: usize,
    #[serde(skip)]
    batches: usize,
}

impl SaveOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one batch worth of callback output.
    ///
    /// All fields of the batch must have the same number of values, and after
    /// the first batch the set of fields may not change.
    pub fn extend(&mut self, batch: FieldValues) -> Result<(), OutputsError> {
        let batch_len = batch.values().map(Vec::len).next().unwrap_or(0);
        if let Some((field, values)) = batch.iter().find(|(_, v)| v.len() != batch_len) {
            return Err(OutputsError::Ragged {
                field: field.clone(),
                expected: batch_len,
                found: values.len(),
            });
        }

        if self.batches > 0 {
            if let Some(missing) = self.fields.keys().find(|k| !batch.contains_key(*k)) {
                return Err(OutputsError::MissingField(missing.clone()));
            }
            if let Some(extra) = batch.keys().find(|k| !self.fields.contains_key(*k)) {
                return Err(OutputsError::UnexpectedField(extra.clone()));
            }
        }

        for (field, values) in batch {
            self.fields.entry(field).or_default().extend(values);
        }
        self.examples += batch_len;
        self.batches += 1;
        Ok(())
    }

    /// Number of examples accumulated.
    pub fn len(&self) -> usize {
        self.examples
    }

    pub fn is_empty(&self) -> bool {
        self.examples == 0
    }

    pub fn field(&self, name: &str) -> Option<&[Value]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn insert_metrics(&mut self, metrics: &BTreeMap<String, f64>) {
        self.metrics
            .extend(metrics.iter().map(|(k, v)| (k.clone(), *v)));
    }

    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(pairs: &[(&str, Vec<Value>)]) -> FieldValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn batches_concatenate_in_order() {
        let mut outputs = SaveOutputs::new();
        outputs
            .extend(batch(&[("id", vec![json!("a"), json!("b")])]))
            .unwrap();
        outputs.extend(batch(&[("id", vec![json!("c")])])).unwrap();

        assert_eq!(outputs.len(), 3);
        assert_eq!(
            outputs.field("id").unwrap(),
            &[json!("a"), json!("b"), json!("c")]
        );
    }

    #[test]
    fn ragged_batch_is_rejected() {
        let mut outputs = SaveOutputs::new();
        let err = outputs
            .extend(batch(&[
                ("prediction", vec![json!(1.0), json!(2.0)]),
                ("target", vec![json!(1.0)]),
            ]))
            .unwrap_err();
        assert!(matches!(err, OutputsError::Ragged { found: 1, .. }));
        assert!(outputs.is_empty());
    }

    #[test]
    fn field_set_is_fixed_after_first_batch() {
        let mut outputs = SaveOutputs::new();
        outputs.extend(batch(&[("a", vec![json!(1)])])).unwrap();

        let err = outputs.extend(batch(&[("b", vec![json!(1)])])).unwrap_err();
        assert_eq!(err, OutputsError::MissingField("a".to_string()));
    }

    #[test]
    fn callbacks_may_not_share_a_field() {
        let mut fields = batch(&[("prediction", vec![json!(1.0)])]);
        merge_fields(&mut fields, batch(&[("id", vec![json!("a")])])).unwrap();

        let err = merge_fields(
            &mut fields,
            batch(&[("prediction", vec![json!(2.0)]), ("z", vec![json!(0)])]),
        )
        .unwrap_err();
        assert_eq!(err, OutputsError::DuplicateField("prediction".to_string()));
        assert_eq!(fields["prediction"], vec![json!(1.0)]);
        assert!(!fields.contains_key("z"));
    }

    #[test]
    fn metrics_serialize_beside_fields() {
        let mut outputs = SaveOutputs::new();
        outputs.extend(batch(&[("target", vec![json!(1)])])).unwrap();
        outputs.insert_metrics(&BTreeMap::from([("mse".to_string(), 0.25)]));

        let value = serde_json::to_value(&outputs).unwrap();
        assert_eq!(value, json!({"target": [1], "mse": 0.25}));
    }
}
