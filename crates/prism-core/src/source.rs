//! # Data Sources
//!
//! Descriptors shared between the planner and the adapters: source type
//! tags, capability sets, performance snapshots and the normalized record
//! every backend emits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical backend a SOURCE node can read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// In-memory ring of the most recent records.
    Hot,
    /// Pre-aggregated daily buckets.
    Aggregate,
    /// Latest computed metric per seller/metric type.
    MetricsCache,
    /// Full-fidelity historical store.
    Cold,
    /// Remote push sources.
    Webhook,
}

impl SourceType {
    pub const ALL: [SourceType; 5] = [
        SourceType::Hot,
        SourceType::Aggregate,
        SourceType::MetricsCache,
        SourceType::Cold,
        SourceType::Webhook,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hot" => Some(Self::Hot),
            "aggregate" => Some(Self::Aggregate),
            "metrics_cache" | "metrics-cache" => Some(Self::MetricsCache),
            "cold" => Some(Self::Cold),
            "webhook" => Some(Self::Webhook),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hot => write!(f, "hot"),
            Self::Aggregate => write!(f, "aggregate"),
            Self::MetricsCache => write!(f, "metrics_cache"),
            Self::Cold => write!(f, "cold"),
            Self::Webhook => write!(f, "webhook"),
        }
    }
}

/// Advisory capability declarations. Adapters do not enforce them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    TimeRange,
    Filtering,
    Aggregation,
    Join,
    Streaming,
}

/// Last-measured performance profile of an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub avg_latency_ms: f64,
    pub throughput_per_sec: f64,
    /// Fraction of successful fetches, in `[0, 1]`.
    pub reliability: f64,
    pub measured_at_ms: i64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            avg_latency_ms: 0.0,
            throughput_per_sec: 0.0,
            reliability: 1.0,
            measured_at_ms: 0,
        }
    }
}

/// Serializable descriptor for a registered adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceInfo {
    pub id: String,
    pub source_type: SourceType,
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub performance: PerformanceMetrics,
    pub healthy: bool,
}

/// A normalized record emitted by any adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub seller_id: String,
    /// Event or metric type, e.g. `order`, `page_view`, `daily_aggregate`.
    pub record_type: String,
    pub timestamp_ms: i64,
    pub payload: serde_json::Value,
}

impl Record {
    /// Look up a join/filter key: envelope fields first, then a payload path
    /// (`payload.a.b`, `a.b` or a JSON pointer).
    pub fn field(&self, key: &str) -> Option<serde_json::Value> {
        match key {
            "id" => return Some(serde_json::Value::String(self.id.clone())),
            "seller_id" => return Some(serde_json::Value::String(self.seller_id.clone())),
            "record_type" => return Some(serde_json::Value::String(self.record_type.clone())),
            "timestamp_ms" => return Some(serde_json::json!(self.timestamp_ms)),
            _ => {}
        }

        let key = key.strip_prefix("payload.").unwrap_or(key);
        let pointer = if key.starts_with('/') {
            key.to_string()
        } else {
            format!("/{}", key.replace('.', "/"))
        };
        self.payload.pointer(&pointer).cloned()
    }

    /// The numeric `value` field most operators work on.
    pub fn value(&self) -> Option<f64> {
        self.payload.get("value").and_then(serde_json::Value::as_f64)
    }
}
