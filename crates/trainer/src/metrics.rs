//! Built-in metrics. Each takes the `target` and `prediction` fields that
//! `save_predictions` accumulated, one JSON value per example.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::cmp::Ordering;

use tape_core::batch::IGNORE_INDEX;

fn numbers(value: &Value, out: &mut Vec<f64>) -> Result<()> {
    match value {
        Value::Number(n) => out.push(n.as_f64().context("non-finite number")?),
        Value::Array(items) => {
            for item in items {
                numbers(item, out)?;
            }
        }
        other => bail!("expected a number or list of numbers, got {}", other),
    }
    Ok(())
}

fn flatten(values: &[Value]) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        numbers(value, &mut out)?;
    }
    Ok(out)
}

/// Flattened targets and predictions, checked to line up.
fn paired(targets: &[Value], predictions: &[Value]) -> Result<(Vec<f64>, Vec<f64>)> {
    let targets = flatten(targets)?;
    let predictions = flatten(predictions)?;
    if targets.len() != predictions.len() {
        bail!(
            "{} target values but {} predictions",
            targets.len(),
            predictions.len()
        );
    }
    if targets.is_empty() {
        bail!("no values to score");
    }
    Ok((targets, predictions))
}

pub fn mean_squared_error(targets: &[Value], predictions: &[Value]) -> Result<f64> {
    let (t, p) = paired(targets, predictions)?;
    let total: f64 = t.iter().zip(&p).map(|(t, p)| (t - p).powi(2)).sum();
    Ok(total / t.len() as f64)
}

pub fn mean_absolute_error(targets: &[Value], predictions: &[Value]) -> Result<f64> {
    let (t, p) = paired(targets, predictions)?;
    let total: f64 = t.iter().zip(&p).map(|(t, p)| (t - p).abs()).sum();
    Ok(total / t.len() as f64)
}

/// Ranks starting at 1, ties sharing their average rank.
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let average = (start + end + 1) as f64 / 2.0;
        for &index in &order[start..end] {
            ranks[index] = average;
        }
        start = end;
    }
    ranks
}

fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        cov += (a - mean_x) * (b - mean_y);
        var_x += (a - mean_x).powi(2);
        var_y += (b - mean_y).powi(2);
    }
    if var_x == 0.0 || var_y == 0.0 {
        return f64::NAN;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

pub fn spearmanr(targets: &[Value], predictions: &[Value]) -> Result<f64> {
    let (t, p) = paired(targets, predictions)?;
    Ok(pearson(&ranks(&t), &ranks(&p)))
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map_or(0, |(i, _)| i)
}

/// Fraction of correct predictions. A prediction list longer than its target
/// is read as logits and scored by its argmax; equal-length lists are scored
/// position by position, skipping ignored positions.
pub fn accuracy(targets: &[Value], predictions: &[Value]) -> Result<f64> {
    if targets.len() != predictions.len() {
        bail!(
            "{} targets but {} predictions",
            targets.len(),
            predictions.len()
        );
    }

    let mut correct = 0usize;
    let mut total = 0usize;
    for (target, prediction) in targets.iter().zip(predictions) {
        let mut t = Vec::new();
        let mut p = Vec::new();
        numbers(target, &mut t)?;
        numbers(prediction, &mut p)?;

        if t.len() == 1 && p.len() > 1 {
            total += 1;
            if argmax(&p) as f64 == t[0] {
                correct += 1;
            }
        } else if t.len() == p.len() {
            for (t, p) in t.iter().zip(&p) {
                if *t == IGNORE_INDEX as f64 {
                    continue;
                }
                total += 1;
                if t == p {
                    correct += 1;
                }
            }
        } else {
            bail!("target of {} values against {} predictions", t.len(), p.len());
        }
    }

    if total == 0 {
        bail!("no scored positions");
    }
    Ok(correct as f64 / total as f64)
}
