//! Cartesian expansion of a run config into distributed training runs.

use clap::{CommandFactory, Parser};
use rand::Rng;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

use crate::args::DistributedTrainCli;
use crate::error::{Result, TapeError};
use crate::launcher::run_train_distributed;
use crate::logging::{setup_logging, LogLevel, GRIDSEARCH_TARGET};
use crate::request::RunRequest;

pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Fields that hold lists by nature and are never searched over.
const SCALAR_LIST_FIELDS: &[&str] = &["metrics"];

/// One combination of grid values and the request that runs it.
#[derive(Debug, Clone, PartialEq)]
pub struct GridPoint {
    pub index: usize,
    /// The chosen value of each grid dimension, in dimension order.
    pub values: Vec<(String, Value)>,
    pub request: RunRequest,
}

impl GridPoint {
    pub fn exp_name(&self) -> Option<&str> {
        self.request.get_str("exp_name")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointOutcome {
    pub index: usize,
    pub exp_name: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridsearchReport {
    pub batch_id: String,
    pub outcomes: Vec<PointOutcome>,
}

impl GridsearchReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// Reads a JSON or YAML (`.yaml`/`.yml`) config, keeping field order.
pub fn load_config(path: &Path) -> Result<Map<String, Value>> {
    let text = fs::read_to_string(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let value: Value = if is_yaml {
        serde_yaml::from_str(&text).map_err(|err| {
            TapeError::config(format!("Invalid gridsearch config {}: {}", path.display(), err))
        })?
    } else {
        serde_json::from_str(&text).map_err(|err| {
            TapeError::config(format!("Invalid gridsearch config {}: {}", path.display(), err))
        })?
    };
    match value {
        Value::Object(fields) => Ok(fields),
        _ => Err(TapeError::config(format!(
            "Gridsearch config {} must be a mapping of argument names to values",
            path.display()
        ))),
    }
}

/// `gridsearch_NNNNNN`, shared by every point of one search.
pub fn batch_id() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("gridsearch_{:06}", suffix)
}

/// Every combination of the list-valued fields of `config`, in field order
/// with the last dimension varying fastest.
///
/// Each point runs quietly, saves nothing through callbacks, is named
/// `{batch_id}_{index}` and coordinates on `master_port + index`.
pub fn expand(config: &Map<String, Value>, batch_id: &str) -> Result<Vec<GridPoint>> {
    let mut fixed = Map::new();
    let mut dims: Vec<(&str, &[Value])> = Vec::new();
    for (name, value) in config {
        match value {
            Value::Array(values) if !SCALAR_LIST_FIELDS.contains(&name.as_str()) => {
                if values.is_empty() {
                    return Err(TapeError::config(format!(
                        "Gridsearch field '{}' has no values",
                        name
                    )));
                }
                dims.push((name.as_str(), values.as_slice()));
            }
            _ => {
                fixed.insert(name.clone(), value.clone());
            }
        }
    }

    let base = RunRequest::from_map(fixed)
        .with("log_level", LogLevel::Warn.to_string())
        .with("save_callback", Value::Array(Vec::new()));
    let total: usize = dims.iter().map(|(_, values)| values.len()).product();

    let mut points = Vec::with_capacity(total);
    for index in 0..total {
        let mut rest = index;
        let mut values = Vec::with_capacity(dims.len());
        for (name, choices) in dims.iter().rev() {
            values.push((name.to_string(), choices[rest % choices.len()].clone()));
            rest /= choices.len();
        }
        values.reverse();

        let overlaid = base.with_overrides(values.clone());
        let port = master_port(&overlaid, index)?;
        let request = overlaid
            .with("exp_name", format!("{}_{}", batch_id, index))
            .with("master_port", port);
        points.push(GridPoint {
            index,
            values,
            request,
        });
    }
    Ok(points)
}

fn master_port(request: &RunRequest, index: usize) -> Result<u16> {
    let base = match request.get("master_port") {
        None | Some(Value::Null) => u64::from(DEFAULT_MASTER_PORT),
        Some(value) => value.as_u64().ok_or_else(|| {
            TapeError::config(format!("master_port must be a port number, got {}", value))
        })?,
    };
    u16::try_from(base + index as u64).map_err(|_| {
        TapeError::config(format!(
            "Gridsearch point {} would use port {}, beyond 65535",
            index,
            base + index as u64
        ))
    })
}

fn scalar_arg(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(TapeError::config(format!(
            "Gridsearch field '{}' must be a scalar, got {}",
            name, other
        ))),
    }
}

/// Command line that the distributed-train parser reads back as `request`.
/// Fields the parser does not know are left out; nulls mean "not given".
pub fn to_argv(request: &RunRequest) -> Result<Vec<String>> {
    let command = DistributedTrainCli::command();
    let mut argv = vec![command.get_name().to_string()];

    for arg in command.get_positionals() {
        let name = arg.get_id().as_str();
        if let Some(value) = request.get(name) {
            argv.push(scalar_arg(name, value)?);
        }
    }

    for arg in command.get_arguments().filter(|arg| !arg.is_positional()) {
        let (Some(long), name) = (arg.get_long(), arg.get_id().as_str()) else {
            continue;
        };
        let flag = format!("--{}", long);
        match request.get(name) {
            None | Some(Value::Null) => {}
            Some(value) if !arg.get_action().takes_values() => {
                if value.as_bool() == Some(true) {
                    argv.push(flag);
                }
            }
            Some(Value::Array(items)) => {
                if !items.is_empty() {
                    argv.push(flag);
                    for item in items {
                        argv.push(scalar_arg(name, item)?);
                    }
                }
            }
            Some(value) => {
                argv.push(flag);
                argv.push(scalar_arg(name, value)?);
            }
        }
    }
    Ok(argv)
}

/// Runs `request` through the distributed-train parser so that path and
/// range checks apply, filling unset fields with their defaults. Fields the
/// parser does not know are kept as given.
pub fn validate_point(request: &RunRequest) -> Result<RunRequest> {
    let argv = to_argv(request)?;
    let cli = DistributedTrainCli::try_parse_from(&argv)
        .map_err(|err| TapeError::config(err.render().to_string()))?;
    let parsed = RunRequest::from_args(&cli.args)?;
    let extras = request
        .fields()
        .iter()
        .filter(|(name, _)| !parsed.contains(name))
        .map(|(name, value)| (name.clone(), value.clone()));
    Ok(parsed.with_overrides(extras.collect::<Vec<_>>()))
}

/// Expands `config` and hands each validated point to `run_point`. A failing
/// point is logged and the search moves on.
pub fn run_gridsearch_with<F>(
    config: &Map<String, Value>,
    batch_id: &str,
    mut run_point: F,
) -> Result<GridsearchReport>
where
    F: FnMut(&RunRequest) -> Result<()>,
{
    let points = expand(config, batch_id)?;
    let total = points.len();
    let mut outcomes = Vec::with_capacity(total);

    for point in points {
        log::info!(
            target: GRIDSEARCH_TARGET,
            "Running gridsearch {} / {} with args {:?}",
            point.index,
            total,
            point.values
        );
        let exp_name = point.exp_name().unwrap_or_default().to_string();
        let result = validate_point(&point.request).and_then(|request| run_point(&request));
        let error = match result {
            Ok(()) => None,
            Err(err) => {
                log::error!(
                    target: GRIDSEARCH_TARGET,
                    "Gridsearch {} ({}) failed: {}",
                    point.index,
                    exp_name,
                    err
                );
                Some(err.to_string())
            }
        };
        outcomes.push(PointOutcome {
            index: point.index,
            exp_name,
            error,
        });
    }

    let report = GridsearchReport {
        batch_id: batch_id.to_string(),
        outcomes,
    };
    log::info!(
        target: GRIDSEARCH_TARGET,
        "Gridsearch {} finished: {} runs, {} failed",
        report.batch_id,
        total,
        report.failed()
    );
    Ok(report)
}

/// Runs one distributed training per point of the config at `config_file`.
pub fn run_gridsearch(config_file: &Path) -> Result<GridsearchReport> {
    setup_logging(-1, None, LogLevel::Warn)?;
    let config = load_config(config_file)?;
    run_gridsearch_with(&config, &batch_id(), |request| {
        run_train_distributed(Some(request.clone()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(fields) => fields,
            _ => unreachable!(),
        }
    }

    #[test]
    fn last_dimension_varies_fastest() {
        let config = object(json!({
            "learning_rate": [0.1, 0.01],
            "model_type": "lstm",
            "seed": [1, 2, 3],
        }));
        let points = expand(&config, "gridsearch_000042").unwrap();
        let pairs: Vec<(Value, Value)> = points
            .iter()
            .map(|p| (p.values[0].1.clone(), p.values[1].1.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (json!(0.1), json!(1)),
                (json!(0.1), json!(2)),
                (json!(0.1), json!(3)),
                (json!(0.01), json!(1)),
                (json!(0.01), json!(2)),
                (json!(0.01), json!(3)),
            ]
        );
        assert_eq!(points[4].exp_name(), Some("gridsearch_000042_4"));
        assert_eq!(points[4].request.get_i64("master_port"), Some(29504));
        assert_eq!(points[4].request.get_str("log_level"), Some("WARN"));
        assert_eq!(points[4].request.get("save_callback"), Some(&json!([])));
    }

    #[test]
    fn metrics_list_is_not_a_dimension() {
        let config = object(json!({"metrics": ["mse", "spearmanr"], "master_port": 30000}));
        let points = expand(&config, "b").unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].request.get("metrics"), Some(&json!(["mse", "spearmanr"])));
        assert_eq!(points[0].request.get_i64("master_port"), Some(30000));
    }

    #[test]
    fn empty_dimension_is_a_config_error() {
        let config = object(json!({"seed": []}));
        assert!(matches!(expand(&config, "b"), Err(TapeError::Config(_))));
    }

    #[test]
    fn argv_uses_flags_for_booleans_and_skips_unknown_fields() {
        let request = RunRequest::new()
            .with("model_type", "lstm")
            .with("task", "stability")
            .with("fp16", true)
            .with("no_eval", false)
            .with("local_rank", -1)
            .with("exp_name", Value::Null)
            .with("metrics", json!(["mse"]));
        let argv = to_argv(&request).unwrap();
        assert_eq!(
            argv,
            vec![
                "tape-train-distributed",
                "lstm",
                "stability",
                "--local-rank",
                "-1",
                "--fp16",
            ]
        );
    }

    #[test]
    fn yaml_config_keeps_field_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.yaml");
        fs::write(&path, "task: stability\nseed: [1, 2]\nbatch_size: 8\n").unwrap();
        let config = load_config(&path).unwrap();
        let names: Vec<&String> = config.keys().collect();
        assert_eq!(names, vec!["task", "seed", "batch_size"]);
    }
}
