//! # Metrics Cache Adapter
//!
//! Holds only the latest computed metric per (seller, metric type). The
//! time window is ignored, which is why this adapter declares FILTERING
//! and nothing else.

use std::collections::HashMap;

use prism_core::{Capability, Record, SourceConfig, SourceType};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{matches_type, DataSourceAdapter, PerformanceTracker, SourceError};

const CAPABILITIES: [Capability; 1] = [Capability::Filtering];

pub struct MetricsCacheAdapter {
    id: String,
    latest: RwLock<HashMap<(String, String), Record>>,
    tracker: PerformanceTracker,
}

impl Default for MetricsCacheAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCacheAdapter {
    pub fn new() -> Self {
        Self {
            id: "metrics-cache".into(),
            latest: RwLock::new(HashMap::new()),
            tracker: PerformanceTracker::new(),
        }
    }
}

#[async_trait::async_trait]
impl DataSourceAdapter for MetricsCacheAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::MetricsCache
    }

    fn name(&self) -> &str {
        "Metrics cache"
    }

    fn capabilities(&self) -> &[Capability] {
        &CAPABILITIES
    }

    fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    async fn fetch(
        &self,
        config: &SourceConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled(self.id.clone()));
        }
        let latest = self.latest.read().await;
        let mut records: Vec<Record> = latest
            .values()
            .filter(|r| r.seller_id == config.seller_id && matches_type(r, config))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.record_type.cmp(&b.record_type));
        Ok(records)
    }

    async fn health_check(&self) -> bool {
        true
    }

    /// Upsert; an older metric never replaces a newer one.
    async fn ingest(&self, records: Vec<Record>) -> Result<usize, SourceError> {
        let mut latest = self.latest.write().await;
        let mut stored = 0;
        for record in records {
            let key = (record.seller_id.clone(), record.record_type.clone());
            let newer = latest
                .get(&key)
                .map_or(true, |existing| existing.timestamp_ms <= record.timestamp_ms);
            if newer {
                latest.insert(key, record);
                stored += 1;
            }
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{FederationMode, SamplingPolicy, TimeWindow};

    fn metric(metric_type: &str, ts: i64, value: f64) -> Record {
        Record {
            id: format!("m-{}-{}", metric_type, ts),
            seller_id: "s1".into(),
            record_type: metric_type.into(),
            timestamp_ms: ts,
            payload: serde_json::json!({"value": value}),
        }
    }

    #[tokio::test]
    async fn test_serves_latest_metric_regardless_of_window() {
        let adapter = MetricsCacheAdapter::new();
        adapter
            .ingest(vec![
                metric("revenue", 100, 1.0),
                metric("revenue", 300, 3.0),
                metric("revenue", 200, 2.0),
                metric("conversion_rate", 50, 0.02),
            ])
            .await
            .unwrap();

        let config = SourceConfig {
            seller_id: "s1".into(),
            // Window excludes every stored timestamp on purpose.
            window: TimeWindow::new(10_000, 20_000),
            sources: vec![SourceType::MetricsCache],
            federation: FederationMode::Single,
            record_type: Some("revenue".into()),
            sampling: SamplingPolicy::default(),
            required_capabilities: Vec::new(),
        };
        let out = adapter
            .fetch(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value(), Some(3.0));
        assert!(!adapter.supports(Capability::TimeRange));
        assert!(adapter.supports(Capability::Filtering));
    }
}
