//! # Hot Ring-Buffer Adapter
//!
//! Most recent records in memory. A fetch scans newest-first and returns at
//! most `window` matching records (in chronological order), then applies
//! the SOURCE node's sampling policy.

use prism_core::{Capability, Record, SourceConfig, SourceType};
use prism_io::Ring;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{apply_sampling, matches, DataSourceAdapter, PerformanceTracker, SourceError};

pub const DEFAULT_HOT_WINDOW: usize = 512;

const CAPABILITIES: [Capability; 3] = [
    Capability::TimeRange,
    Capability::Filtering,
    Capability::Streaming,
];

pub struct HotBufferAdapter {
    id: String,
    ring: RwLock<Ring<Record>>,
    window: usize,
    tracker: PerformanceTracker,
}

impl HotBufferAdapter {
    pub fn new(capacity: usize, window: usize) -> Self {
        Self {
            id: "hot-ring".into(),
            ring: RwLock::new(Ring::with_capacity(capacity)),
            window: window.max(1),
            tracker: PerformanceTracker::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.ring.read().await.len()
    }
}

#[async_trait::async_trait]
impl DataSourceAdapter for HotBufferAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Hot
    }

    fn name(&self) -> &str {
        "Hot ring buffer"
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
        let mut recent: Vec<Record> = {
            let ring = self.ring.read().await;
            ring.iter()
                .rev()
                .filter(|r| matches(r, config))
                .take(self.window)
                .cloned()
                .collect()
        };
        recent.reverse();
        Ok(apply_sampling(recent, &config.sampling, &config.window))
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn ingest(&self, records: Vec<Record>) -> Result<usize, SourceError> {
        let mut ring = self.ring.write().await;
        let count = records.len();
        for record in records {
            ring.push(record);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{FederationMode, SamplingPolicy, TimeWindow};

    fn record(seller: &str, ts: i64) -> Record {
        Record {
            id: format!("{}-{}", seller, ts),
            seller_id: seller.into(),
            record_type: "order".into(),
            timestamp_ms: ts,
            payload: serde_json::json!({"value": ts as f64}),
        }
    }

    fn config(window: TimeWindow) -> SourceConfig {
        SourceConfig {
            seller_id: "s1".into(),
            window,
            sources: vec![SourceType::Hot],
            federation: FederationMode::Single,
            record_type: None,
            sampling: SamplingPolicy::default(),
            required_capabilities: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_most_recent_window_in_order() {
        let adapter = HotBufferAdapter::new(1000, 3);
        let records = (0..10)
            .map(|ts| record("s1", ts))
            .chain((0..10).map(|ts| record("s2", ts)))
            .collect();
        adapter.ingest(records).await.unwrap();

        let out = adapter
            .fetch(&config(TimeWindow::new(0, 100)), &CancellationToken::new())
            .await
            .unwrap();
        let ts: Vec<i64> = out.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(ts, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_ring_capacity_drops_oldest() {
        let adapter = HotBufferAdapter::new(5, 512);
        adapter
            .ingest((0..8).map(|ts| record("s1", ts)).collect())
            .await
            .unwrap();
        assert_eq!(adapter.len().await, 5);

        let out = adapter
            .fetch(&config(TimeWindow::new(0, 100)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.first().map(|r| r.timestamp_ms), Some(3));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_fails_fast() {
        let adapter = HotBufferAdapter::new(10, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = adapter
            .fetch(&config(TimeWindow::new(0, 1)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Cancelled(_)));
    }
}
