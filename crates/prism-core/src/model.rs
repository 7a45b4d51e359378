//! # Query Requests
//!
//! The declarative request a seller-facing caller submits. A request is
//! immutable once submitted; the compiler only ever reads it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::QueryError;
use crate::plan::{ExecutionMode, FederationMode};
use crate::source::{Capability, SourceType};

/// What the caller wants to learn about the seller.
///
/// Unrecognized names are preserved as [`QueryKind::Other`] so the compiler
/// can apply its safe default instead of rejecting the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QueryKind {
    Anomaly,
    Prediction,
    Insight,
    Funnel,
    Custom,
    Other(String),
}

impl From<String> for QueryKind {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ANOMALY" => Self::Anomaly,
            "PREDICTION" => Self::Prediction,
            "INSIGHT" => Self::Insight,
            "FUNNEL" => Self::Funnel,
            "CUSTOM" => Self::Custom,
            _ => Self::Other(raw),
        }
    }
}

impl From<QueryKind> for String {
    fn from(kind: QueryKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anomaly => write!(f, "ANOMALY"),
            Self::Prediction => write!(f, "PREDICTION"),
            Self::Insight => write!(f, "INSIGHT"),
            Self::Funnel => write!(f, "FUNNEL"),
            Self::Custom => write!(f, "CUSTOM"),
            Self::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// Half-open-by-convention time range in epoch milliseconds (`start <= end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start && ts_ms <= self.end
    }

    pub fn duration_ms(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

/// Requested rendering of the final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputFormat {
    #[default]
    #[serde(alias = "json")]
    Json,
    #[serde(alias = "csv")]
    Csv,
    #[serde(alias = "summary")]
    Summary,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "JSON"),
            Self::Csv => write!(f, "CSV"),
            Self::Summary => write!(f, "SUMMARY"),
        }
    }
}

/// Optional ceilings carried from the request into the plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConstraints {
    pub max_latency_ms: Option<u64>,
    pub min_confidence: Option<f64>,
    pub max_cost: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    #[default]
    None,
    /// Independent per-record inclusion at `rate`.
    Uniform,
    /// Inclusion probability grows with recency inside the window.
    Adaptive,
}

/// Record-level sampling applied by adapters that support it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingPolicy {
    #[serde(default)]
    pub mode: SamplingMode,
    #[serde(default = "default_sampling_rate")]
    pub rate: f64,
}

fn default_sampling_rate() -> f64 {
    1.0
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            mode: SamplingMode::None,
            rate: default_sampling_rate(),
        }
    }
}

impl SamplingPolicy {
    pub fn is_enabled(&self) -> bool {
        self.mode != SamplingMode::None
    }
}

/// A declarative analytics query.
///
/// `seller_id`, `query_type` and `window` are required; they are optional
/// here only so that a missing field surfaces as [`QueryError::InvalidRequest`]
/// from [`QueryRequest::validate`] instead of a transport-level decode error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub seller_id: String,
    #[serde(default, alias = "kind")]
    pub query_type: Option<QueryKind>,
    #[serde(default)]
    pub window: Option<TimeWindow>,
    /// Ordered transform operator names.
    #[serde(default)]
    pub operators: Vec<String>,
    /// Aggregate function names applied after the transforms.
    #[serde(default)]
    pub aggregations: Vec<String>,
    #[serde(default, rename = "output")]
    pub output_formats: Vec<OutputFormat>,
    #[serde(default)]
    pub constraints: Option<QueryConstraints>,
    #[serde(default)]
    pub sampling: Option<SamplingPolicy>,
    /// Source type tags to read from. Empty means the configured default.
    #[serde(default)]
    pub sources: Vec<SourceType>,
    #[serde(default)]
    pub federation: Option<FederationMode>,
    #[serde(default)]
    pub record_type: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    /// Forbids non-deterministic steps such as record sampling.
    #[serde(default)]
    pub reproducible: bool,
}

impl QueryRequest {
    /// Convenience constructor for the three required fields.
    pub fn new(seller_id: impl Into<String>, kind: QueryKind, window: TimeWindow) -> Self {
        Self {
            seller_id: seller_id.into(),
            query_type: Some(kind),
            window: Some(window),
            ..Default::default()
        }
    }

    pub fn with_operators<I, S>(mut self, operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operators = operators.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output(mut self, format: OutputFormat) -> Self {
        self.output_formats.push(format);
        self
    }

    /// Reject requests with missing or malformed fields.
    ///
    /// Returns the required triple so callers do not have to re-unwrap it.
    pub fn validate(&self) -> Result<(&str, &QueryKind, TimeWindow), QueryError> {
        let seller_id = self.seller_id.trim();
        if seller_id.is_empty() {
            return Err(QueryError::InvalidRequest("sellerId is required".into()));
        }
        let kind = self
            .query_type
            .as_ref()
            .ok_or_else(|| QueryError::InvalidRequest("queryType is required".into()))?;
        let window = self
            .window
            .ok_or_else(|| QueryError::InvalidRequest("window is required".into()))?;
        if window.start > window.end {
            return Err(QueryError::InvalidRequest(format!(
                "window start {} is after end {}",
                window.start, window.end
            )));
        }

        if let Some(sampling) = &self.sampling {
            if sampling.is_enabled() {
                if !(sampling.rate > 0.0 && sampling.rate <= 1.0) {
                    return Err(QueryError::InvalidRequest(format!(
                        "sampling rate {} must be in (0, 1]",
                        sampling.rate
                    )));
                }
                if self.reproducible {
                    return Err(QueryError::InvalidRequest(
                        "sampling cannot be used when reproducibility is required".into(),
                    ));
                }
            }
        }

        if let Some(constraints) = &self.constraints {
            if let Some(min_confidence) = constraints.min_confidence {
                if !(0.0..=1.0).contains(&min_confidence) {
                    return Err(QueryError::InvalidRequest(format!(
                        "minConfidence {} must be in [0, 1]",
                        min_confidence
                    )));
                }
            }
        }

        match &self.federation {
            Some(FederationMode::Partial { min_sources }) if *min_sources == 0 => {
                return Err(QueryError::InvalidRequest(
                    "min_sources must be at least 1".into(),
                ));
            }
            Some(FederationMode::Merge(crate::plan::MergeStrategy::Join { key }))
                if key.trim().is_empty() =>
            {
                return Err(QueryError::InvalidRequest(
                    "join merge strategy requires a key".into(),
                ));
            }
            _ => {}
        }

        Ok((seller_id, kind, window))
    }
}
