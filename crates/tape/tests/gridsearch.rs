use serde_json::{json, Map, Value};
use std::collections::HashSet;

use tape::gridsearch::{expand, run_gridsearch_with};
use tape::{RunRequest, TapeError};

fn config(data_dir: &str) -> Map<String, Value> {
    let value = json!({
        "model_type": "lstm",
        "task": "stability",
        "data_dir": data_dir,
        "learning_rate": [1e-3, 1e-4],
        "batch_size": [8, 16, 32],
        "num_train_epochs": 2,
        "seed": [1, 2, 3, 4],
        "metrics": ["mse"],
        "master_port": 31000,
    });
    match value {
        Value::Object(fields) => fields,
        _ => unreachable!(),
    }
}

#[test]
fn grid_points_have_distinct_names_and_ports() {
    let points = expand(&config("./data"), "gridsearch_123456").unwrap();
    assert_eq!(points.len(), 2 * 3 * 4);

    let names: HashSet<&str> = points.iter().filter_map(|p| p.exp_name()).collect();
    let ports: HashSet<i64> = points
        .iter()
        .filter_map(|p| p.request.get_i64("master_port"))
        .collect();
    assert_eq!(names.len(), points.len());
    assert_eq!(ports.len(), points.len());

    for point in &points {
        assert_eq!(
            point.exp_name(),
            Some(format!("gridsearch_123456_{}", point.index).as_str())
        );
        assert_eq!(
            point.request.get_i64("master_port"),
            Some(31000 + point.index as i64)
        );
        assert_eq!(point.request.get("metrics"), Some(&json!(["mse"])));
    }
    // Deterministic across expansions.
    assert_eq!(expand(&config("./data"), "gridsearch_123456").unwrap(), points);
}

#[test]
fn every_point_runs_even_after_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path().to_str().unwrap());
    let mut launched: Vec<RunRequest> = Vec::new();

    let report = run_gridsearch_with(&config, "gridsearch_000001", |request| {
        launched.push(request.clone());
        if launched.len() == 2 {
            return Err(TapeError::WorkerFailure {
                rank: 0,
                code: Some(1),
            });
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(launched.len(), 24);
    assert_eq!(report.outcomes.len(), 24);
    assert_eq!(report.failed(), 1);
    assert!(report.outcomes[1].error.is_some());

    // Validation filled in the parser defaults and kept the search overrides.
    let first = &launched[0];
    assert_eq!(first.get_str("exp_name"), Some("gridsearch_000001_0"));
    assert_eq!(first.get_str("log_level"), Some("WARN"));
    assert_eq!(first.get_i64("batch_size"), Some(8));
    assert_eq!(first.get_i64("seed"), Some(1));
    assert_eq!(first.get_i64("warmup_steps"), Some(10000));
    assert_eq!(first.get_i64("nproc_per_node"), Some(1));
    assert_eq!(first.get("save_callback"), Some(&json!([])));
    assert_eq!(launched[23].get_i64("master_port"), Some(31023));
}

#[test]
fn invalid_point_is_reported_without_running() {
    let mut config = config("/definitely/not/a/dir");
    config.insert("seed".to_string(), json!(7));
    let mut runs = 0;

    let report = run_gridsearch_with(&config, "gridsearch_000002", |_| {
        runs += 1;
        Ok(())
    })
    .unwrap();

    assert_eq!(runs, 0);
    assert_eq!(report.failed(), report.outcomes.len());
    assert_eq!(report.outcomes.len(), 6);
}
