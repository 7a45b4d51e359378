//! # Planner Catalog
//!
//! Static lookup tables the compiler consults: per-operator default
//! parameters, aggregate defaults, the default scoring algorithm for each
//! score type and the data-sufficiency thresholds. The compiler only sees
//! the [`PlannerCatalog`] trait, so these tables can later come from an
//! external config store.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::plan::{Params, ScoreType};

pub const DEFAULT_CATALOG_VERSION: &str = "catalog-v1";

/// Qualitative tier describing whether enough records exist for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSufficiency {
    Insufficient,
    Minimal,
    Adequate,
    Optimal,
}

/// Record-count floors for each tier above `Insufficient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SufficiencyThresholds {
    pub minimal: usize,
    pub adequate: usize,
    pub optimal: usize,
}

impl Default for SufficiencyThresholds {
    fn default() -> Self {
        Self {
            minimal: 10,
            adequate: 50,
            optimal: 200,
        }
    }
}

impl SufficiencyThresholds {
    pub fn classify(&self, records: usize) -> DataSufficiency {
        if records >= self.optimal {
            DataSufficiency::Optimal
        } else if records >= self.adequate {
            DataSufficiency::Adequate
        } else if records >= self.minimal {
            DataSufficiency::Minimal
        } else {
            DataSufficiency::Insufficient
        }
    }
}

/// Mapping-lookup capability the compiler depends on.
pub trait PlannerCatalog: Send + Sync {
    /// Default parameters for a transform operator; `None` if unknown.
    fn operator_defaults(&self, operator: &str) -> Option<Params>;

    /// Default parameters for an aggregate function; `None` if unknown.
    fn aggregate_defaults(&self, function: &str) -> Option<Params>;

    /// Default scoring algorithm name and parameters for a score type.
    fn score_defaults(&self, score_type: ScoreType) -> (String, Params);

    fn sufficiency(&self) -> SufficiencyThresholds;

    fn version(&self) -> &str;
}

/// Built-in tables, optionally overlaid with configured overrides.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    operators: BTreeMap<String, Params>,
    aggregates: BTreeMap<String, Params>,
    sufficiency: SufficiencyThresholds,
    version: String,
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self {
            operators: default_operator_table(),
            aggregates: default_aggregate_table(),
            sufficiency: SufficiencyThresholds::default(),
            version: DEFAULT_CATALOG_VERSION.to_string(),
        }
    }
}

impl StaticCatalog {
    /// Merge per-operator overrides into the defaults. Unknown operators in
    /// `overrides` become known, with exactly the given parameters.
    pub fn with_operator_overrides(mut self, overrides: BTreeMap<String, Params>) -> Self {
        for (name, params) in overrides {
            let entry = self.operators.entry(name.to_ascii_uppercase()).or_default();
            entry.extend(params);
        }
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl PlannerCatalog for StaticCatalog {
    fn operator_defaults(&self, operator: &str) -> Option<Params> {
        self.operators.get(&operator.to_ascii_uppercase()).cloned()
    }

    fn aggregate_defaults(&self, function: &str) -> Option<Params> {
        self.aggregates.get(&function.to_ascii_uppercase()).cloned()
    }

    fn score_defaults(&self, score_type: ScoreType) -> (String, Params) {
        match score_type {
            ScoreType::Anomaly => (
                "zscore_anomaly".into(),
                params(&[("threshold", json!(3.0))]),
            ),
            ScoreType::Prediction => (
                "linear_trend".into(),
                params(&[("horizon", json!(24))]),
            ),
            ScoreType::Health => ("health_index".into(), Params::new()),
            ScoreType::Quality => (
                "data_quality".into(),
                params(&[("expected_fields", json!(["value"]))]),
            ),
        }
    }

    fn sufficiency(&self) -> SufficiencyThresholds {
        self.sufficiency
    }

    fn version(&self) -> &str {
        &self.version
    }
}

fn params(entries: &[(&str, serde_json::Value)]) -> Params {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn default_operator_table() -> BTreeMap<String, Params> {
    let table = [
        ("FIR", params(&[("taps", json!(8)), ("window", json!("hamming"))])),
        ("FFT", params(&[("size", json!(256)), ("window", json!("hann"))])),
        ("HFD", params(&[("kmax", json!(10))])),
        (
            "KALMAN",
            params(&[
                ("process_noise", json!(1e-5)),
                ("measurement_noise", json!(0.1)),
            ]),
        ),
        ("EWMA", params(&[("alpha", json!(0.3))])),
        ("DIFF", params(&[("lag", json!(1))])),
        ("NORMALIZE", Params::new()),
        ("CLIP", params(&[("min", json!(0.0)), ("max", json!(1.0e9))])),
    ];
    table
        .into_iter()
        .map(|(name, p)| (name.to_string(), p))
        .collect()
}

fn default_aggregate_table() -> BTreeMap<String, Params> {
    let table = [
        ("COUNT", Params::new()),
        ("SUM", params(&[("field", json!("value"))])),
        ("AVG", params(&[("field", json!("value"))])),
        ("MIN", params(&[("field", json!("value"))])),
        ("MAX", params(&[("field", json!("value"))])),
        ("DAILY", params(&[("bucket_ms", json!(86_400_000))])),
    ];
    table
        .into_iter()
        .map(|(name, p)| (name.to_string(), p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_lookup_is_case_insensitive() {
        let catalog = StaticCatalog::default();
        let fir = catalog.operator_defaults("fir").unwrap();
        assert_eq!(fir.get("taps"), Some(&json!(8)));
        assert!(catalog.operator_defaults("WAVELET").is_none());
        assert!(catalog.operator_defaults("NORMALIZE").is_some());
    }

    #[test]
    fn test_overrides_merge_parameters() {
        let mut overrides = BTreeMap::new();
        overrides.insert("FIR".to_string(), params(&[("taps", json!(32))]));
        overrides.insert("wavelet".to_string(), params(&[("level", json!(3))]));
        let catalog = StaticCatalog::default().with_operator_overrides(overrides);

        let fir = catalog.operator_defaults("FIR").unwrap();
        assert_eq!(fir.get("taps"), Some(&json!(32)));
        assert_eq!(fir.get("window"), Some(&json!("hamming")));
        assert!(catalog.operator_defaults("WAVELET").is_some());
    }

    #[test]
    fn test_sufficiency_tiers() {
        let t = SufficiencyThresholds::default();
        assert_eq!(t.classify(0), DataSufficiency::Insufficient);
        assert_eq!(t.classify(10), DataSufficiency::Minimal);
        assert_eq!(t.classify(199), DataSufficiency::Adequate);
        assert_eq!(t.classify(500), DataSufficiency::Optimal);
    }
}
