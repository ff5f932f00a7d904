//! Agent metric reports.
//!
//! Agents send either a ready report object or an array of points. Points are
//! folded into one report per `(timestamp aligned to step, tags)`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ingest::IngestError;
use crate::storage::MetricsRecord;

/// Reporting window assumed when a point has no usable `step` (seconds).
pub const DEFAULT_STEP: i64 = 60;

/// A pre-aggregated report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub timestamp: i64,
    pub rule_counts: BTreeMap<String, i64>,
    pub total_count: i64,
    pub duration: i64,
    #[serde(default)]
    pub tag: String,
}

impl From<MetricsReport> for MetricsRecord {
    fn from(report: MetricsReport) -> Self {
        Self {
            timestamp: report.timestamp,
            rule_counts: report.rule_counts,
            total_count: report.total_count,
            duration: report.duration,
            tag: report.tag,
        }
    }
}

/// Body of the batch endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsBatch {
    pub metrics: Vec<MetricsReport>,
}

fn as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

/// Fold points into one record per aligned timestamp and tag string.
///
/// Points missing a numeric `timestamp` or `value` are skipped.
pub fn aggregate_points(points: &[Value]) -> Vec<MetricsRecord> {
    let mut grouped: BTreeMap<(i64, String), MetricsRecord> = BTreeMap::new();

    for point in points {
        let Some(timestamp) = point.get("timestamp").and_then(as_i64) else {
            continue;
        };
        let Some(value) = point.get("value").and_then(Value::as_f64) else {
            continue;
        };
        let metric = point.get("metric").and_then(Value::as_str).unwrap_or("");
        let tags = point.get("tags").and_then(Value::as_str).unwrap_or("");
        let step = point
            .get("step")
            .and_then(as_i64)
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_STEP);

        let aligned = timestamp - timestamp.rem_euclid(step);
        let record = grouped
            .entry((aligned, tags.to_string()))
            .or_insert_with(|| MetricsRecord {
                timestamp: aligned,
                duration: step,
                tag: tags.to_string(),
                ..Default::default()
            });

        let count = value as i64;
        if !metric.is_empty() {
            *record.rule_counts.entry(metric.to_string()).or_default() += count;
        }
        record.total_count += count;
    }

    grouped.into_values().collect()
}

/// Decode the single-report endpoint body: a point array or one report.
pub fn decode_metrics_body(body: Value) -> Result<Vec<MetricsRecord>, IngestError> {
    if let Value::Array(points) = &body
        && !points.is_empty()
    {
        return Ok(aggregate_points(points));
    }
    serde_json::from_value::<MetricsReport>(body)
        .map(|report| vec![report.into()])
        .map_err(|e| IngestError::Malformed(e.to_string()))
}
