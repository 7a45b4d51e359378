//! # Cold Store Adapter
//!
//! Full-fidelity historical records behind the [`EventStore`] query
//! surface. The in-process [`MemoryEventStore`] simulates backend latency
//! so the executor's deadline and cancellation paths see real suspension.

use std::sync::Arc;
use std::time::Duration;

use prism_core::{Capability, Record, SourceConfig, SourceType, TimeWindow};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{DataSourceAdapter, PerformanceTracker, SourceError};

const CAPABILITIES: [Capability; 4] = [
    Capability::TimeRange,
    Capability::Filtering,
    Capability::Aggregation,
    Capability::Join,
];

/// Read surface over time-ranged records keyed by seller and record type.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    async fn query(
        &self,
        seller_id: &str,
        window: TimeWindow,
        record_type: Option<&str>,
    ) -> Result<Vec<Record>, SourceError>;

    async fn append(&self, records: Vec<Record>) -> Result<usize, SourceError>;

    async fn ping(&self) -> bool;
}

pub struct MemoryEventStore {
    records: RwLock<Vec<Record>>,
    latency: Duration,
}

impl MemoryEventStore {
    pub fn new(latency: Duration) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            latency,
        }
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryEventStore {
    async fn query(
        &self,
        seller_id: &str,
        window: TimeWindow,
        record_type: Option<&str>,
    ) -> Result<Vec<Record>, SourceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let records = self.records.read().await;
        let mut out: Vec<Record> = records
            .iter()
            .filter(|r| {
                r.seller_id == seller_id
                    && window.contains(r.timestamp_ms)
                    && record_type.map_or(true, |t| r.record_type == t)
            })
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp_ms);
        Ok(out)
    }

    async fn append(&self, records: Vec<Record>) -> Result<usize, SourceError> {
        let count = records.len();
        self.records.write().await.extend(records);
        Ok(count)
    }

    async fn ping(&self) -> bool {
        true
    }
}

pub struct ColdStoreAdapter {
    id: String,
    store: Arc<dyn EventStore>,
    tracker: PerformanceTracker,
}

impl ColdStoreAdapter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            id: "cold-store".into(),
            store,
            tracker: PerformanceTracker::new(),
        }
    }
}

#[async_trait::async_trait]
impl DataSourceAdapter for ColdStoreAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Cold
    }

    fn name(&self) -> &str {
        "Cold historical store"
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
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SourceError::Cancelled(self.id.clone())),
            result = self.store.query(
                &config.seller_id,
                config.window,
                config.record_type.as_deref(),
            ) => result,
        }
    }

    async fn health_check(&self) -> bool {
        self.store.ping().await
    }

    async fn ingest(&self, records: Vec<Record>) -> Result<usize, SourceError> {
        self.store.append(records).await
    }
}
