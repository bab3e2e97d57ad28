use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, TapeError};

/// A parameter struct filled from a [`RunRequest`] by field name.
pub trait FromRunRequest: DeserializeOwned {
    /// Every field the struct reads. All must be present in the request,
    /// even those that may be null.
    const FIELDS: &'static [&'static str];
}

impl FromRunRequest for trainer::TrainParams {
    const FIELDS: &'static [&'static str] = trainer::TrainParams::FIELDS;
}

/// The named fields driving one workflow execution, in insertion order.
///
/// Never mutated in place: `with` and `with_overrides` return new requests,
/// so a base request can be shared by every run derived from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    fields: Map<String, Value>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Captures parsed arguments field by field.
    pub fn from_args<T: Serialize>(args: &T) -> Result<Self> {
        match serde_json::to_value(args)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(TapeError::config(format!(
                "arguments must serialize to named fields, got {}",
                other
            ))),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let fields: Map<String, Value> = serde_json::from_str(json)?;
        Ok(Self { fields })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// A copy with `name` set to `value`. An existing field keeps its position.
    pub fn with(&self, name: &str, value: impl Into<Value>) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(name.to_string(), value.into());
        Self { fields }
    }

    pub fn with_overrides<I, K>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut fields = self.fields.clone();
        for (name, value) in overrides {
            fields.insert(name.into(), value);
        }
        Self { fields }
    }

    /// Names from `names` that this request lacks, sorted.
    pub fn missing(&self, names: &[&str]) -> Vec<String> {
        let mut missing: Vec<String> = names
            .iter()
            .filter(|name| !self.fields.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Fills `T` from the fields it declares; extra fields are ignored.
    pub fn resolve<T: FromRunRequest>(&self) -> Result<T> {
        let missing = self.missing(T::FIELDS);
        if !missing.is_empty() {
            return Err(TapeError::MissingArguments(missing));
        }
        let selected: Map<String, Value> = T::FIELDS
            .iter()
            .filter_map(|name| {
                self.fields
                    .get(*name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect();
        serde_json::from_value(Value::Object(selected))
            .map_err(|err| TapeError::config(format!("Invalid run request: {}", err)))
    }

    /// Integer field, if present and integral.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pair {
        left: u32,
        right: Option<String>,
    }

    impl FromRunRequest for Pair {
        const FIELDS: &'static [&'static str] = &["left", "right"];
    }

    fn request(value: Value) -> RunRequest {
        match value {
            Value::Object(fields) => RunRequest::from_map(fields),
            _ => unreachable!(),
        }
    }

    #[test]
    fn with_leaves_the_original_untouched() {
        let base = request(json!({"a": 1, "b": 2}));
        let derived = base.with("a", 10).with("c", 3);

        assert_eq!(base.get("a"), Some(&json!(1)));
        assert!(!base.contains("c"));
        let names: Vec<&String> = derived.fields().keys().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(derived.get_i64("a"), Some(10));
    }

    #[test]
    fn resolve_reports_every_missing_name() {
        let err = RunRequest::new().resolve::<Pair>().unwrap_err();
        match err {
            TapeError::MissingArguments(names) => assert_eq!(names, vec!["left", "right"]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn null_satisfies_an_optional_field_and_extras_are_ignored() {
        let pair = request(json!({"left": 4, "right": null, "unused": true}))
            .resolve::<Pair>()
            .unwrap();
        assert_eq!(pair, Pair { left: 4, right: None });
    }

    #[test]
    fn ill_typed_field_is_a_config_error() {
        let err = request(json!({"left": "four", "right": null}))
            .resolve::<Pair>()
            .unwrap_err();
        assert!(matches!(err, TapeError::Config(_)));
    }

    #[test]
    fn json_round_trip_keeps_field_order() {
        let original = request(json!({"z": 1, "a": [1, 2], "m": null}));
        let restored = RunRequest::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(restored, original);
        let names: Vec<&String> = restored.fields().keys().collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }
}
