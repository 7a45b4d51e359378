//! Fake adapters for coordinator, executor and service tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use prism_core::{Capability, Record, SourceConfig, SourceType};
use tokio_util::sync::CancellationToken;

use super::registry::SourceRegistry;
use super::{DataSourceAdapter, PerformanceTracker, SourceError};

const ALL_CAPABILITIES: [Capability; 5] = [
    Capability::TimeRange,
    Capability::Filtering,
    Capability::Aggregation,
    Capability::Join,
    Capability::Streaming,
];

pub struct FakeAdapter {
    id: String,
    source_type: SourceType,
    record_count: usize,
    records: Option<Vec<Record>>,
    fail: bool,
    healthy: bool,
    delay: Duration,
    stall: Duration,
    capabilities: Vec<Capability>,
    fetches: AtomicUsize,
    tracker: PerformanceTracker,
}

impl FakeAdapter {
    pub fn new(id: &str, source_type: SourceType, record_count: usize) -> Self {
        Self {
            id: id.to_string(),
            source_type,
            record_count,
            records: None,
            fail: false,
            healthy: true,
            delay: Duration::ZERO,
            stall: Duration::ZERO,
            capabilities: ALL_CAPABILITIES.to_vec(),
            fetches: AtomicUsize::new(0),
            tracker: PerformanceTracker::new(),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block the polling thread for `stall` so the fetch completes on its
    /// first poll but still consumes wall time.
    pub fn with_stall(mut self, stall: Duration) -> Self {
        self.stall = stall;
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    /// Serve exactly these records instead of synthetic ones.
    pub fn with_records(mut self, records: Vec<Record>) -> Self {
        self.record_count = records.len();
        self.records = Some(records);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn synthetic(&self, config: &SourceConfig) -> Vec<Record> {
        let span = config.window.duration_ms().max(1);
        let n = self.record_count.max(1) as i64;
        (0..self.record_count)
            .map(|i| Record {
                id: format!("{}-{}", self.id, i),
                seller_id: config.seller_id.clone(),
                record_type: "order".into(),
                timestamp_ms: config.window.start + span * i as i64 / n,
                payload: serde_json::json!({
                    "value": 100.0 + 10.0 * ((i as f64) / 7.0).sin(),
                    "sku": format!("sku-{}", i % 5),
                }),
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DataSourceAdapter for FakeAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        self.source_type
    }

    fn name(&self) -> &str {
        "Fake adapter"
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    async fn fetch(
        &self,
        config: &SourceConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.stall.is_zero() {
            std::thread::sleep(self.stall);
        }
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SourceError::Cancelled(self.id.clone())),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        if self.fail {
            return Err(SourceError::Backend {
                adapter: self.id.clone(),
                message: "injected failure".into(),
            });
        }
        Ok(match &self.records {
            Some(records) => records.clone(),
            None => self.synthetic(config),
        })
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}

/// Health flag of `source_type` as the registry reports it.
pub async fn health_of(registry: &SourceRegistry, source_type: SourceType) -> Option<bool> {
    registry
        .list()
        .await
        .into_iter()
        .find(|info| info.source_type == source_type)
        .map(|info| info.healthy)
}
