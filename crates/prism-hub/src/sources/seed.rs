//! # Demo Seeding
//!
//! Synthetic order traffic for `--seed-demo`: a daily cycle with noise and
//! a few injected spikes, loaded into every in-memory backend.

use prism_core::{Record, SourceType};
use rand::Rng;
use serde_json::json;

use super::registry::SourceRegistry;

pub const DEMO_SELLER: &str = "demo-seller";

const HOUR_MS: i64 = 3_600_000;

/// One order record per `step_ms` over the `days` before `now_ms`.
pub fn demo_orders(seller_id: &str, now_ms: i64, days: i64, step_ms: i64) -> Vec<Record> {
    let mut rng = rand::thread_rng();
    let start = now_ms - days * 24 * HOUR_MS;
    let step = step_ms.max(1);

    (0..)
        .map(|i| start + i * step)
        .take_while(|ts| *ts <= now_ms)
        .enumerate()
        .map(|(i, ts)| {
            let hour = (ts / HOUR_MS) % 24;
            let cycle = (hour as f64 / 24.0 * std::f64::consts::TAU).sin();
            let mut value = 120.0 + 40.0 * cycle + rng.gen_range(-8.0..8.0);
            if rng.gen_bool(0.005) {
                value *= 4.0;
            }
            Record {
                id: format!("demo-{}", i),
                seller_id: seller_id.to_string(),
                record_type: "order".into(),
                timestamp_ms: ts,
                payload: json!({
                    "value": (value * 100.0).round() / 100.0,
                    "sku": format!("SKU-{:03}", rng.gen_range(1..40)),
                    "channel": if rng.gen_bool(0.7) { "web" } else { "mobile" },
                }),
            }
        })
        .collect()
}

/// Latest cached metrics for the metrics-cache backend.
pub fn demo_metrics(seller_id: &str, now_ms: i64) -> Vec<Record> {
    [
        ("revenue_24h", 2875.40),
        ("conversion_rate", 0.031),
        ("avg_order_value", 118.2),
    ]
    .into_iter()
    .map(|(metric, value)| Record {
        id: format!("metric-{}-{}", seller_id, metric),
        seller_id: seller_id.to_string(),
        record_type: metric.to_string(),
        timestamp_ms: now_ms,
        payload: json!({ "value": value }),
    })
    .collect()
}

/// Load demo data into every registered in-memory backend.
pub async fn seed_registry(registry: &SourceRegistry, seller_id: &str, now_ms: i64) -> usize {
    let orders = demo_orders(seller_id, now_ms, 7, 5 * 60_000);
    let mut loaded = 0;

    for source_type in [SourceType::Hot, SourceType::Aggregate, SourceType::Cold] {
        if let Some(adapter) = registry.resolve(source_type).await {
            match adapter.ingest(orders.clone()).await {
                Ok(n) => loaded += n,
                Err(e) => tracing::warn!("Seeding '{}' failed: {}", source_type, e),
            }
        }
    }
    if let Some(adapter) = registry.resolve(SourceType::MetricsCache).await {
        match adapter.ingest(demo_metrics(seller_id, now_ms)).await {
            Ok(n) => loaded += n,
            Err(e) => tracing::warn!("Seeding metrics cache failed: {}", e),
        }
    }

    tracing::info!(
        "Seeded {} records for demo seller '{}' ({} orders)",
        loaded,
        seller_id,
        orders.len()
    );
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_orders_cover_the_range() {
        let now = 10 * 24 * HOUR_MS;
        let orders = demo_orders("s1", now, 1, HOUR_MS);
        assert_eq!(orders.len(), 25);
        assert_eq!(orders.first().map(|r| r.timestamp_ms), Some(now - 24 * HOUR_MS));
        assert_eq!(orders.last().map(|r| r.timestamp_ms), Some(now));
        assert!(orders.iter().all(|r| r.value().is_some()));
    }
}
