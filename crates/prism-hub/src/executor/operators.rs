//! # Node Operators
//!
//! Pure functions behind TRANSFORM, AGGREGATE, SCORE and OUTPUT nodes. They
//! work on JSON record arrays (the serialized form of [`prism_core::Record`])
//! and read the numeric `payload.value` field.
//!
//! Transform and aggregate lookups return `Ok(None)` for names they do not
//! implement; the executor passes the input through and records a warning.
//! Scoring is stricter: an unknown algorithm is an error.

use std::collections::{BTreeMap, HashSet};
use std::f64::consts::PI;

use prism_core::{
    AggregateConfig, DataSufficiency, OutputConfig, OutputFormat, Params, ScoreConfig,
    SufficiencyThresholds, TransformConfig,
};
use serde_json::{json, Map, Value};

pub type OperatorResult<T> = Result<T, String>;

// =============================================================================
// Helpers
// =============================================================================

fn param_f64(params: &Params, name: &str, default: f64) -> OperatorResult<f64> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| format!("parameter '{}' must be a number, got {}", name, v)),
    }
}

const DAY_MS: i64 = 86_400_000;

fn param_usize(params: &Params, name: &str, default: usize) -> OperatorResult<usize> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| format!("parameter '{}' must be a non-negative integer", name)),
    }
}

fn param_str<'a>(params: &'a Params, name: &str, default: &'a str) -> &'a str {
    params.get(name).and_then(Value::as_str).unwrap_or(default)
}

fn record_array(input: &Value) -> OperatorResult<&Vec<Value>> {
    input
        .as_array()
        .ok_or_else(|| "expected a record array as input".to_string())
}

fn value_of(record: &Value) -> Option<f64> {
    record.pointer("/payload/value").and_then(Value::as_f64)
}

fn field_of(record: &Value, field: &str) -> Option<f64> {
    let path = field.strip_prefix("payload.").unwrap_or(field);
    record
        .get("payload")?
        .pointer(&format!("/{}", path.replace('.', "/")))
        .and_then(Value::as_f64)
}

fn set_value(record: &mut Value, value: f64) {
    if let Some(payload) = record.get_mut("payload").and_then(Value::as_object_mut) {
        payload.insert("value".into(), json!(value));
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Least-squares slope and intercept of `values` against their index.
fn linear_fit(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if values.len() < 2 {
        return (0.0, values.first().copied().unwrap_or(0.0));
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    let slope = if den == 0.0 { 0.0 } else { num / den };
    (slope, mean_y - slope * mean_x)
}

/// Replace `value` on every record that carries one with `f(series)[i]`.
fn map_series(
    input: &Value,
    f: impl FnOnce(&[f64]) -> Vec<f64>,
) -> OperatorResult<Value> {
    let mut records = record_array(input)?.clone();
    let indices: Vec<usize> = (0..records.len())
        .filter(|i| value_of(&records[*i]).is_some())
        .collect();
    let series: Vec<f64> = indices.iter().filter_map(|i| value_of(&records[*i])).collect();
    let mapped = f(&series);
    for (idx, v) in indices.into_iter().zip(mapped) {
        set_value(&mut records[idx], v);
    }
    Ok(Value::Array(records))
}

// =============================================================================
// Transforms
// =============================================================================

/// Apply a transform. `Ok(None)` means no implementation exists.
pub fn apply_transform(config: &TransformConfig, input: &Value) -> OperatorResult<Option<Value>> {
    let params = &config.params;
    let out = match config.operator.to_ascii_uppercase().as_str() {
        "FIR" => {
            let taps = param_usize(params, "taps", 8)?.max(1);
            let weights = window_weights(param_str(params, "window", "hamming"), taps);
            map_series(input, |x| fir(x, &weights))?
        }
        "EWMA" => {
            let alpha = param_f64(params, "alpha", 0.3)?;
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(format!("EWMA alpha {} must be in (0, 1]", alpha));
            }
            map_series(input, |x| ewma(x, alpha))?
        }
        "DIFF" => {
            let lag = param_usize(params, "lag", 1)?.max(1);
            diff(input, lag)?
        }
        "NORMALIZE" => map_series(input, |x| {
            let (mean, std) = mean_std(x);
            x.iter()
                .map(|v| if std == 0.0 { 0.0 } else { (v - mean) / std })
                .collect()
        })?,
        "CLIP" => {
            let min = param_f64(params, "min", f64::NEG_INFINITY)?;
            let max = param_f64(params, "max", f64::INFINITY)?;
            if min > max {
                return Err(format!("CLIP min {} is greater than max {}", min, max));
            }
            map_series(input, |x| x.iter().map(|v| v.clamp(min, max)).collect())?
        }
        _ => return Ok(None),
    };
    Ok(Some(out))
}

fn window_weights(kind: &str, taps: usize) -> Vec<f64> {
    if taps == 1 {
        return vec![1.0];
    }
    let span = (taps - 1) as f64;
    (0..taps)
        .map(|k| {
            let phase = 2.0 * PI * k as f64 / span;
            match kind {
                "hamming" => 0.54 - 0.46 * phase.cos(),
                "hann" => 0.5 - 0.5 * phase.cos(),
                _ => 1.0,
            }
        })
        .collect()
}

/// Causal FIR: each output uses the current sample and up to `taps - 1`
/// previous ones, renormalized over the taps actually available.
fn fir(x: &[f64], weights: &[f64]) -> Vec<f64> {
    (0..x.len())
        .map(|i| {
            let (mut acc, mut norm) = (0.0, 0.0);
            for (k, w) in weights.iter().enumerate().take(i + 1) {
                acc += w * x[i - k];
                norm += w;
            }
            if norm == 0.0 {
                x[i]
            } else {
                acc / norm
            }
        })
        .collect()
}

fn ewma(x: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(x.len());
    let mut state: Option<f64> = None;
    for v in x {
        let next = match state {
            Some(prev) => alpha * v + (1.0 - alpha) * prev,
            None => *v,
        };
        out.push(next);
        state = Some(next);
    }
    out
}

/// Lagged difference. The first `lag` valued records have no predecessor
/// and are dropped, as are records without a value.
fn diff(input: &Value, lag: usize) -> OperatorResult<Value> {
    let valued: Vec<&Value> = record_array(input)?
        .iter()
        .filter(|r| value_of(r).is_some())
        .collect();
    let out = valued
        .iter()
        .enumerate()
        .skip(lag)
        .map(|(i, record)| {
            let current = value_of(record).unwrap_or(0.0);
            let previous = value_of(valued[i - lag]).unwrap_or(0.0);
            let mut record = (*record).clone();
            set_value(&mut record, current - previous);
            record
        })
        .collect();
    Ok(Value::Array(out))
}

// =============================================================================
// Aggregates
// =============================================================================

/// Apply an aggregate function. `Ok(None)` means no implementation exists.
pub fn apply_aggregate(config: &AggregateConfig, input: &Value) -> OperatorResult<Option<Value>> {
    let records = record_array(input)?;
    let function = config.function.to_ascii_uppercase();
    let field = param_str(&config.params, "field", "value");
    let values: Vec<f64> = records.iter().filter_map(|r| field_of(r, field)).collect();

    let value = match function.as_str() {
        "COUNT" => json!(records.len()),
        "SUM" => json!(values.iter().sum::<f64>()),
        "AVG" if values.is_empty() => Value::Null,
        "AVG" => json!(values.iter().sum::<f64>() / values.len() as f64),
        "MIN" => values
            .iter()
            .copied()
            .reduce(f64::min)
            .map_or(Value::Null, |v| json!(v)),
        "MAX" => values
            .iter()
            .copied()
            .reduce(f64::max)
            .map_or(Value::Null, |v| json!(v)),
        "DAILY" => {
            let bucket_ms = param_bucket_ms(&config.params)?;
            return Ok(Some(daily_buckets(records, field, bucket_ms)));
        }
        _ => return Ok(None),
    };

    let template = records.last();
    Ok(Some(json!([{
        "id": format!("agg-{}", function.to_ascii_lowercase()),
        "seller_id": template.and_then(|r| r.get("seller_id")).cloned().unwrap_or(Value::Null),
        "record_type": "aggregate",
        "timestamp_ms": template.and_then(|r| r.get("timestamp_ms")).cloned().unwrap_or(json!(0)),
        "payload": {
            "value": value,
            "function": function,
            "count": records.len(),
        },
    }])))
}

fn param_bucket_ms(params: &Params) -> OperatorResult<i64> {
    match params.get("bucket_ms") {
        None | Some(Value::Null) => Ok(DAY_MS),
        Some(v) => v
            .as_i64()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| format!("parameter 'bucket_ms' must be a positive integer, got {}", v)),
    }
}

fn daily_buckets(records: &[Value], field: &str, bucket_ms: i64) -> Value {
    let mut buckets: BTreeMap<i64, (f64, usize, Option<Value>)> = BTreeMap::new();
    for record in records {
        let Some(ts) = record.get("timestamp_ms").and_then(Value::as_i64) else {
            continue;
        };
        let Some(start) = ts.checked_sub(ts.rem_euclid(bucket_ms)) else {
            continue;
        };
        let entry = buckets.entry(start).or_insert((0.0, 0, None));
        entry.0 += field_of(record, field).unwrap_or(0.0);
        entry.1 += 1;
        if entry.2.is_none() {
            entry.2 = record.get("seller_id").cloned();
        }
    }
    Value::Array(
        buckets
            .into_iter()
            .map(|(start, (sum, count, seller))| {
                json!({
                    "id": format!("bucket-{}", start),
                    "seller_id": seller.unwrap_or(Value::Null),
                    "record_type": "daily_aggregate",
                    "timestamp_ms": start,
                    "payload": {"value": sum, "count": count, "bucket_ms": bucket_ms},
                })
            })
            .collect(),
    )
}

// =============================================================================
// Scoring
// =============================================================================

/// Confidence for a sufficiency tier. Below the minimal floor it grows
/// linearly from zero.
pub fn tier_confidence(
    tier: DataSufficiency,
    samples: usize,
    thresholds: &SufficiencyThresholds,
) -> f64 {
    match tier {
        DataSufficiency::Insufficient => {
            0.25 * (samples as f64 / thresholds.minimal.max(1) as f64).min(1.0)
        }
        DataSufficiency::Minimal => 0.5,
        DataSufficiency::Adequate => 0.75,
        DataSufficiency::Optimal => 0.95,
    }
}

fn attribution(factors: &[(&str, f64)]) -> Value {
    Value::Array(
        factors
            .iter()
            .map(|(factor, weight)| json!({"factor": factor, "weight": weight}))
            .collect(),
    )
}

/// Run the named scoring algorithm over a record array.
pub fn apply_score(
    config: &ScoreConfig,
    input: &Value,
    thresholds: &SufficiencyThresholds,
) -> OperatorResult<Value> {
    let records = record_array(input)?;
    let values: Vec<f64> = records.iter().filter_map(value_of).collect();
    let tier = thresholds.classify(values.len());
    let confidence = tier_confidence(tier, values.len(), thresholds);

    let mut body = match config.algorithm.as_str() {
        "zscore_anomaly" => zscore_anomaly(records, &config.params)?,
        "linear_trend" => linear_trend(&values, &config.params)?,
        "health_index" => health_index(records, &values),
        "data_quality" => data_quality(records, &config.params),
        other => return Err(format!("unknown scoring algorithm '{}'", other)),
    };

    body.insert("score_type".into(), json!(config.score_type.to_string()));
    body.insert("algorithm".into(), json!(config.algorithm));
    body.insert("confidence".into(), json!(confidence));
    body.insert("sufficiency".into(), json!(tier));
    body.insert("samples".into(), json!(values.len()));
    Ok(Value::Object(body))
}

fn zscore_anomaly(records: &[Value], params: &Params) -> OperatorResult<Map<String, Value>> {
    let threshold = param_f64(params, "threshold", 3.0)?;
    if threshold <= 0.0 {
        return Err(format!("threshold {} must be positive", threshold));
    }
    let valued: Vec<(&Value, f64)> = records
        .iter()
        .filter_map(|r| value_of(r).map(|v| (r, v)))
        .collect();
    let values: Vec<f64> = valued.iter().map(|(_, v)| *v).collect();
    let (mean, std) = mean_std(&values);

    let mut max_z: f64 = 0.0;
    let mut anomalies = Vec::new();
    for (record, v) in &valued {
        let z = if std == 0.0 { 0.0 } else { (v - mean) / std };
        max_z = max_z.max(z.abs());
        if z.abs() > threshold {
            anomalies.push(json!({
                "id": record.get("id").cloned().unwrap_or(Value::Null),
                "timestamp_ms": record.get("timestamp_ms").cloned().unwrap_or(Value::Null),
                "value": v,
                "zscore": z,
            }));
        }
    }

    let score = (max_z / (2.0 * threshold)).clamp(0.0, 1.0);
    let rate = if values.is_empty() {
        0.0
    } else {
        anomalies.len() as f64 / values.len() as f64
    };

    let mut body = Map::new();
    body.insert("score".into(), json!(score));
    body.insert(
        "attribution".into(),
        attribution(&[("max_zscore", max_z), ("anomaly_rate", rate)]),
    );
    body.insert("anomaly_count".into(), json!(anomalies.len()));
    body.insert("anomalies".into(), Value::Array(anomalies));
    body.insert("mean".into(), json!(mean));
    body.insert("std_dev".into(), json!(std));
    Ok(body)
}

fn linear_trend(values: &[f64], params: &Params) -> OperatorResult<Map<String, Value>> {
    let horizon = param_usize(params, "horizon", 24)?;
    let (slope, intercept) = linear_fit(values);
    let last_x = values.len().saturating_sub(1) as f64;
    let forecast = intercept + slope * (last_x + horizon as f64);
    let (mean, _) = mean_std(values);
    // Relative change over the horizon, bounded to [-1, 1].
    let score = if mean == 0.0 {
        0.0
    } else {
        (slope * horizon as f64 / mean.abs()).clamp(-1.0, 1.0)
    };

    let mut body = Map::new();
    body.insert("score".into(), json!(score));
    body.insert(
        "attribution".into(),
        attribution(&[("slope", slope), ("baseline", intercept)]),
    );
    body.insert("forecast".into(), json!(forecast));
    body.insert("horizon".into(), json!(horizon));
    Ok(body)
}

fn health_index(records: &[Value], values: &[f64]) -> Map<String, Value> {
    let (mean, std) = mean_std(values);
    let stability = if mean == 0.0 {
        if std == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 / (1.0 + std / mean.abs())
    };
    let (slope, _) = linear_fit(values);
    let momentum = if mean == 0.0 {
        0.5
    } else {
        0.5 + 0.5 * (slope * values.len() as f64 / mean.abs()).tanh()
    };
    let completeness = if records.is_empty() {
        0.0
    } else {
        values.len() as f64 / records.len() as f64
    };

    let weights = [("stability", 0.4), ("momentum", 0.3), ("completeness", 0.3)];
    let components = [stability, momentum, completeness];
    let score: f64 = weights
        .iter()
        .zip(components)
        .map(|((_, w), c)| w * c)
        .sum();

    let mut body = Map::new();
    body.insert("score".into(), json!(score));
    body.insert("attribution".into(), attribution(&weights));
    body.insert(
        "components".into(),
        json!({"stability": stability, "momentum": momentum, "completeness": completeness}),
    );
    body
}

fn data_quality(records: &[Value], params: &Params) -> Map<String, Value> {
    let expected: Vec<&str> = params
        .get("expected_fields")
        .and_then(Value::as_array)
        .map(|fields| fields.iter().filter_map(Value::as_str).collect())
        .unwrap_or_else(|| vec!["value"]);

    let complete = records
        .iter()
        .filter(|r| {
            expected.iter().all(|field| {
                r.get("payload")
                    .and_then(|p| p.get(*field))
                    .is_some_and(|v| !v.is_null())
            })
        })
        .count();
    let unique: HashSet<&str> = records
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_str))
        .collect();

    let (completeness, uniqueness) = if records.is_empty() {
        (0.0, 0.0)
    } else {
        let n = records.len() as f64;
        (complete as f64 / n, unique.len() as f64 / n)
    };
    let score = 0.6 * completeness + 0.4 * uniqueness;

    let mut body = Map::new();
    body.insert("score".into(), json!(score));
    body.insert(
        "attribution".into(),
        attribution(&[("completeness", 0.6), ("uniqueness", 0.4)]),
    );
    body.insert(
        "components".into(),
        json!({"completeness": completeness, "uniqueness": uniqueness}),
    );
    body
}

// =============================================================================
// Output
// =============================================================================

pub fn render_output(config: &OutputConfig, input: Value) -> Value {
    match config.format {
        OutputFormat::Json => truncate(input, config.max_results),
        OutputFormat::Csv => Value::String(to_csv(&input, config.max_results)),
        OutputFormat::Summary => summarize(&input),
    }
}

fn truncate(input: Value, max: usize) -> Value {
    match input {
        Value::Array(mut items) => {
            items.truncate(max);
            Value::Array(items)
        }
        other => other,
    }
}

fn csv_cell(value: Option<&Value>) -> String {
    let raw = match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}

fn to_csv(input: &Value, max: usize) -> String {
    let mut lines = Vec::new();
    match input {
        Value::Array(items) => {
            lines.push("id,seller_id,record_type,timestamp_ms,value".to_string());
            for item in items.iter().take(max) {
                lines.push(
                    [
                        csv_cell(item.get("id")),
                        csv_cell(item.get("seller_id")),
                        csv_cell(item.get("record_type")),
                        csv_cell(item.get("timestamp_ms")),
                        csv_cell(item.pointer("/payload/value")),
                    ]
                    .join(","),
                );
            }
        }
        Value::Object(map) => {
            lines.push("field,value".to_string());
            for (key, value) in map {
                if !value.is_array() && !value.is_object() {
                    lines.push(format!("{},{}", csv_cell(Some(&json!(key))), csv_cell(Some(value))));
                }
            }
        }
        other => lines.push(csv_cell(Some(other))),
    }
    lines.join("\n")
}

fn summarize(input: &Value) -> Value {
    let (kind, length) = match input {
        Value::Array(items) => ("array", items.len()),
        Value::Object(map) => ("object", map.len()),
        Value::String(s) => ("string", s.len()),
        Value::Null => ("null", 0),
        Value::Bool(_) => ("bool", 1),
        Value::Number(_) => ("number", 1),
    };
    json!({
        "type": kind,
        "length": length,
        "score": input.get("score").cloned().unwrap_or(Value::Null),
        "confidence": input.get("confidence").cloned().unwrap_or(Value::Null),
    })
}
