//! # Data Source Adapters
//!
//! Every backend a SOURCE node can read from implements
//! [`DataSourceAdapter`]: hot ring buffer, daily aggregate store, metrics
//! cache, cold historical store and the webhook push buffer. Adapters are
//! registered once in the [`registry::SourceRegistry`] and shared read-mostly.
//!
//! Each `fetch` receives the execution's [`CancellationToken`]; adapters
//! with real suspension points select on it so a latency breach can stop
//! outstanding I/O.

pub mod aggregate;
pub mod cold;
pub mod hot;
pub mod metrics_cache;
pub mod registry;
pub mod seed;
pub mod webhook;

#[cfg(test)]
pub mod testing;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use prism_core::{
    Capability, DataSourceInfo, PerformanceMetrics, Record, SamplingMode, SamplingPolicy,
    SourceConfig, SourceType, TimeWindow,
};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Errors
// =============================================================================

/// Adapter-level failure. Absorbed by the coordinator unless the
/// success-count policy is not met.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("fetch from {0} was cancelled")]
    Cancelled(String),

    #[error("fetch from {adapter} timed out after {timeout_ms}ms")]
    TimedOut { adapter: String, timeout_ms: u64 },

    #[error("{adapter} backend error: {message}")]
    Backend { adapter: String, message: String },

    #[error("{adapter} does not support {operation}")]
    Unsupported { adapter: String, operation: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

// =============================================================================
// Core Trait
// =============================================================================

#[async_trait::async_trait]
pub trait DataSourceAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn source_type(&self) -> SourceType;

    fn name(&self) -> &str;

    /// Declared, advisory capability set.
    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Runtime latency/reliability tracker, fed by [`fetch_instrumented`].
    fn tracker(&self) -> &PerformanceTracker;

    fn performance_snapshot(&self) -> PerformanceMetrics {
        self.tracker().snapshot()
    }

    /// Fetch records for the SOURCE node's seller, window and filters.
    async fn fetch(
        &self,
        config: &SourceConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, SourceError>;

    async fn health_check(&self) -> bool;

    /// Load records into the backend (demo seeding, webhook pushes).
    async fn ingest(&self, _records: Vec<Record>) -> Result<usize, SourceError> {
        Err(SourceError::Unsupported {
            adapter: self.id().to_string(),
            operation: "ingest".into(),
        })
    }

    fn info(&self, healthy: bool) -> DataSourceInfo {
        DataSourceInfo {
            id: self.id().to_string(),
            source_type: self.source_type(),
            name: self.name().to_string(),
            capabilities: self.capabilities().to_vec(),
            performance: self.performance_snapshot(),
            healthy,
        }
    }
}

/// Run `adapter.fetch` and feed the outcome into its performance tracker.
pub async fn fetch_instrumented(
    adapter: &dyn DataSourceAdapter,
    config: &SourceConfig,
    cancel: &CancellationToken,
) -> Result<Vec<Record>, SourceError> {
    if cancel.is_cancelled() {
        return Err(SourceError::Cancelled(adapter.id().to_string()));
    }
    let started = Instant::now();
    let result = adapter.fetch(config, cancel).await;
    let elapsed = started.elapsed();
    match &result {
        Ok(records) => adapter.tracker().record_success(elapsed, records.len()),
        Err(_) => adapter.tracker().record_failure(elapsed),
    }
    result
}

// =============================================================================
// Performance Tracking
// =============================================================================

/// Lock-free per-adapter performance counters.
///
/// Latency is an EWMA (alpha 0.2) in microseconds; reliability is
/// successes / attempts.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    attempts: AtomicU64,
    successes: AtomicU64,
    records_total: AtomicU64,
    busy_us: AtomicU64,
    ewma_latency_us: AtomicU64,
    measured_at_ms: AtomicI64,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration, records: usize) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.records_total
            .fetch_add(records as u64, Ordering::Relaxed);
        self.observe(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.observe(latency);
    }

    fn observe(&self, latency: Duration) {
        let sample = latency.as_micros().min(u64::MAX as u128) as u64;
        let first = self.attempts.fetch_add(1, Ordering::Relaxed) == 0;
        self.busy_us.fetch_add(sample, Ordering::Relaxed);
        let _ = self
            .ewma_latency_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(if first { sample } else { (prev * 4 + sample) / 5 })
            });
        self.measured_at_ms
            .store(crate::now_ms(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerformanceMetrics {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let busy_us = self.busy_us.load(Ordering::Relaxed);
        let records = self.records_total.load(Ordering::Relaxed);

        PerformanceMetrics {
            avg_latency_ms: self.ewma_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            throughput_per_sec: if busy_us > 0 {
                records as f64 / (busy_us as f64 / 1_000_000.0)
            } else {
                0.0
            },
            reliability: if attempts > 0 {
                successes as f64 / attempts as f64
            } else {
                1.0
            },
            measured_at_ms: self.measured_at_ms.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Seller, window and record-type filter shared by every adapter.
pub fn matches(record: &Record, config: &SourceConfig) -> bool {
    record.seller_id == config.seller_id
        && config.window.contains(record.timestamp_ms)
        && matches_type(record, config)
}

pub fn matches_type(record: &Record, config: &SourceConfig) -> bool {
    config
        .record_type
        .as_deref()
        .map_or(true, |t| record.record_type == t)
}

/// Apply record-level sampling. Non-deterministic by nature; the compiler
/// refuses it for reproducible requests.
pub fn apply_sampling(
    records: Vec<Record>,
    policy: &SamplingPolicy,
    window: &TimeWindow,
) -> Vec<Record> {
    let rate = policy.rate.clamp(0.0, 1.0);
    let mut rng = rand::thread_rng();
    match policy.mode {
        SamplingMode::None => records,
        SamplingMode::Uniform => records
            .into_iter()
            .filter(|_| rng.gen_bool(rate))
            .collect(),
        SamplingMode::Adaptive => {
            let span = window.duration_ms().max(1) as f64;
            records
                .into_iter()
                .filter(|r| {
                    let recency = ((r.timestamp_ms - window.start) as f64 / span).clamp(0.0, 1.0);
                    rng.gen_bool((rate * (0.5 + recency)).min(1.0))
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::FederationMode;

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

    fn record(ts: i64) -> Record {
        Record {
            id: format!("r{}", ts),
            seller_id: "s1".into(),
            record_type: "order".into(),
            timestamp_ms: ts,
            payload: serde_json::json!({"value": 1.0}),
        }
    }

    #[test]
    fn test_tracker_reliability_and_latency() {
        let tracker = PerformanceTracker::new();
        assert_eq!(tracker.snapshot().reliability, 1.0);

        tracker.record_success(Duration::from_millis(10), 100);
        tracker.record_failure(Duration::from_millis(20));
        let snap = tracker.snapshot();
        assert_eq!(snap.reliability, 0.5);
        // 10ms seeded, then (4*10 + 20) / 5 = 12ms
        assert!((snap.avg_latency_ms - 12.0).abs() < 1e-9);
        assert!(snap.throughput_per_sec > 0.0);
        assert!(snap.measured_at_ms > 0);
    }

    #[test]
    fn test_matches_filters_seller_window_and_type() {
        let mut cfg = config(TimeWindow::new(10, 20));
        assert!(matches(&record(15), &cfg));
        assert!(!matches(&record(25), &cfg));

        let mut other = record(15);
        other.seller_id = "s2".into();
        assert!(!matches(&other, &cfg));

        cfg.record_type = Some("refund".into());
        assert!(!matches(&record(15), &cfg));
    }

    #[test]
    fn test_sampling_none_keeps_everything() {
        let records: Vec<Record> = (0..50).map(record).collect();
        let kept = apply_sampling(records, &SamplingPolicy::default(), &TimeWindow::new(0, 50));
        assert_eq!(kept.len(), 50);
    }

    #[test]
    fn test_uniform_sampling_at_full_rate_keeps_everything() {
        let records: Vec<Record> = (0..50).map(record).collect();
        let policy = SamplingPolicy {
            mode: SamplingMode::Uniform,
            rate: 1.0,
        };
        assert_eq!(apply_sampling(records, &policy, &TimeWindow::new(0, 50)).len(), 50);
    }

    #[test]
    fn test_adaptive_sampling_favors_recent_records() {
        let window = TimeWindow::new(0, 9_999);
        let records: Vec<Record> = (0..10_000).map(record).collect();
        let policy = SamplingPolicy {
            mode: SamplingMode::Adaptive,
            rate: 0.4,
        };
        let kept = apply_sampling(records, &policy, &window);
        let old = kept.iter().filter(|r| r.timestamp_ms < 5_000).count();
        let recent = kept.len() - old;
        assert!(recent > old, "recent={} old={}", recent, old);
    }
}
