//! # Daily Aggregate Adapter
//!
//! Pre-aggregated daily buckets per seller and record type. Ingested raw
//! records are folded into their UTC day; a fetch emits one record per
//! bucket whose day overlaps the window, with `value` = bucket sum.

use std::collections::BTreeMap;

use prism_core::{Capability, Record, SourceConfig, SourceType};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{matches_type, DataSourceAdapter, PerformanceTracker, SourceError};

pub const DAY_MS: i64 = 86_400_000;

const CAPABILITIES: [Capability; 3] = [
    Capability::TimeRange,
    Capability::Filtering,
    Capability::Aggregation,
];

#[derive(Debug, Clone, Default)]
struct DailyBucket {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl DailyBucket {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }
}

/// (seller, record type, day start)
type BucketKey = (String, String, i64);

pub struct AggregateStoreAdapter {
    id: String,
    buckets: RwLock<BTreeMap<BucketKey, DailyBucket>>,
    tracker: PerformanceTracker,
}

impl Default for AggregateStoreAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateStoreAdapter {
    pub fn new() -> Self {
        Self {
            id: "aggregate-daily".into(),
            buckets: RwLock::new(BTreeMap::new()),
            tracker: PerformanceTracker::new(),
        }
    }

    pub fn day_start(ts_ms: i64) -> i64 {
        ts_ms.div_euclid(DAY_MS) * DAY_MS
    }
}

#[async_trait::async_trait]
impl DataSourceAdapter for AggregateStoreAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Aggregate
    }

    fn name(&self) -> &str {
        "Daily aggregate store"
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
        let buckets = self.buckets.read().await;
        let first_day = Self::day_start(config.window.start);

        let mut records: Vec<Record> = buckets
            .iter()
            .filter(|((seller, _, day), _)| {
                seller == &config.seller_id && *day >= first_day && *day <= config.window.end
            })
            .map(|((seller, record_type, day), bucket)| Record {
                id: format!("agg-{}-{}-{}", seller, record_type, day),
                seller_id: seller.clone(),
                record_type: record_type.clone(),
                timestamp_ms: *day,
                payload: json!({
                    "value": bucket.sum,
                    "count": bucket.count,
                    "min": bucket.min,
                    "max": bucket.max,
                    "avg": bucket.sum / bucket.count.max(1) as f64,
                    "granularity": "daily",
                }),
            })
            .filter(|r| matches_type(r, config))
            .collect();
        records.sort_by_key(|r| r.timestamp_ms);
        Ok(records)
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn ingest(&self, records: Vec<Record>) -> Result<usize, SourceError> {
        let mut buckets = self.buckets.write().await;
        let count = records.len();
        for record in records {
            let value = record.value().unwrap_or(0.0);
            let key = (
                record.seller_id,
                record.record_type,
                Self::day_start(record.timestamp_ms),
            );
            buckets.entry(key).or_default().add(value);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{FederationMode, SamplingPolicy, TimeWindow};

    fn record(record_type: &str, ts: i64, value: f64) -> Record {
        Record {
            id: format!("r{}", ts),
            seller_id: "s1".into(),
            record_type: record_type.into(),
            timestamp_ms: ts,
            payload: json!({"value": value}),
        }
    }

    fn config(window: TimeWindow, record_type: Option<&str>) -> SourceConfig {
        SourceConfig {
            seller_id: "s1".into(),
            window,
            sources: vec![SourceType::Aggregate],
            federation: FederationMode::Single,
            record_type: record_type.map(str::to_string),
            sampling: SamplingPolicy::default(),
            required_capabilities: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_records_fold_into_daily_buckets() {
        let adapter = AggregateStoreAdapter::new();
        adapter
            .ingest(vec![
                record("order", 1_000, 10.0),
                record("order", 2_000, 5.0),
                record("order", DAY_MS + 1, 7.0),
                record("refund", 3_000, 2.0),
            ])
            .await
            .unwrap();

        let out = adapter
            .fetch(
                &config(TimeWindow::new(0, 3 * DAY_MS), Some("order")),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value(), Some(15.0));
        assert_eq!(out[0].payload["count"], json!(2));
        assert_eq!(out[0].payload["min"], json!(5.0));
        assert_eq!(out[1].timestamp_ms, DAY_MS);
    }

    #[tokio::test]
    async fn test_partial_day_window_includes_overlapping_bucket() {
        let adapter = AggregateStoreAdapter::new();
        adapter
            .ingest(vec![record("order", 1_000, 1.0)])
            .await
            .unwrap();
        let out = adapter
            .fetch(
                &config(TimeWindow::new(DAY_MS / 2, DAY_MS / 2 + 10), None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
    }
}
