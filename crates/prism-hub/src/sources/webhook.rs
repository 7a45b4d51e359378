//! # Webhook Adapter
//!
//! Push-based source. The ingest route hands provider payloads to
//! [`WebhookAdapter::ingest_payload`], which maps them onto the common
//! [`Record`] shape and keeps them in a bounded buffer. Provider-specific
//! mapping covers Shopify and Stripe; anything else goes through the
//! generic mapping.
//!
//! Record ids are derived from the provider and payload content, so a
//! redelivered webhook is recognized and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use prism_core::hash::canonical_json;
use prism_core::{Capability, Record, SourceConfig, SourceType};
use prism_io::Ring;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{matches, DataSourceAdapter, PerformanceTracker, SourceError};

const CAPABILITIES: [Capability; 3] = [
    Capability::TimeRange,
    Capability::Filtering,
    Capability::Streaming,
];

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub record: Record,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WebhookStats {
    pub events_total: u64,
    pub duplicates_total: u64,
    pub errors_total: u64,
    pub bytes_total: u64,
    pub buffered: usize,
}

pub struct WebhookAdapter {
    id: String,
    buffer: RwLock<Ring<Record>>,
    events_total: AtomicU64,
    duplicates_total: AtomicU64,
    errors_total: AtomicU64,
    bytes_total: AtomicU64,
    tracker: PerformanceTracker,
}

impl WebhookAdapter {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: "webhook-push".into(),
            buffer: RwLock::new(Ring::with_capacity(capacity)),
            events_total: AtomicU64::new(0),
            duplicates_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            tracker: PerformanceTracker::new(),
        }
    }

    /// Normalize and buffer one provider payload.
    ///
    /// `seller_hint` (from the route) wins over anything found in the
    /// payload or headers.
    pub async fn ingest_payload(
        &self,
        provider: &str,
        seller_hint: Option<&str>,
        payload: Value,
        headers: &HashMap<String, String>,
    ) -> Result<IngestOutcome, SourceError> {
        let record = match normalize_payload(provider, seller_hint, &payload, headers) {
            Ok(record) => record,
            Err(e) => {
                self.errors_total.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let mut buffer = self.buffer.write().await;
        if buffer.iter().any(|r| r.id == record.id) {
            self.duplicates_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Webhook record '{}' already buffered", record.id);
            return Ok(IngestOutcome {
                record,
                duplicate: true,
            });
        }

        let size = payload.to_string().len() as u64;
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(size, Ordering::Relaxed);
        buffer.push(record.clone());

        Ok(IngestOutcome {
            record,
            duplicate: false,
        })
    }

    pub async fn stats(&self) -> WebhookStats {
        WebhookStats {
            events_total: self.events_total.load(Ordering::Relaxed),
            duplicates_total: self.duplicates_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            buffered: self.buffer.read().await.len(),
        }
    }
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_rfc3339_ms(value: Option<&Value>) -> Option<i64> {
    let raw = value?.as_str()?;
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn parse_number(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn content_id(provider: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(payload).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("wh-{}", &digest[..16])
}

/// Map a provider payload onto a [`Record`].
pub fn normalize_payload(
    provider: &str,
    seller_hint: Option<&str>,
    payload: &Value,
    headers: &HashMap<String, String>,
) -> Result<Record, SourceError> {
    let provider = provider.trim().to_ascii_lowercase();
    let (seller, record_type, timestamp_ms, normalized) = match provider.as_str() {
        "shopify" => {
            let seller = header(headers, "x-shopify-shop-domain")
                .map(str::to_string)
                .or_else(|| payload.get("shop_domain").and_then(Value::as_str).map(str::to_string));
            let topic = header(headers, "x-shopify-topic").unwrap_or("orders/create");
            let record_type = topic.replace('/', "_");
            let ts = parse_rfc3339_ms(payload.get("created_at"));
            let line_items = payload
                .get("line_items")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let normalized = json!({
                "provider": "shopify",
                "order_id": payload.get("id").unwrap_or(&Value::Null),
                "value": parse_number(payload.get("total_price")),
                "currency": payload.get("currency").unwrap_or(&Value::Null),
                "line_items": line_items,
                "raw": payload,
            });
            (seller, record_type, ts, normalized)
        }
        "stripe" => {
            let seller = payload
                .get("account")
                .and_then(Value::as_str)
                .map(str::to_string);
            let record_type = payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("stripe_event")
                .replace('.', "_");
            let ts = payload
                .get("created")
                .and_then(Value::as_i64)
                .map(|secs| secs * 1000);
            let amount = payload
                .pointer("/data/object/amount")
                .and_then(Value::as_f64)
                .map(|cents| cents / 100.0);
            let normalized = json!({
                "provider": "stripe",
                "event_id": payload.get("id").unwrap_or(&Value::Null),
                "value": amount,
                "currency": payload.pointer("/data/object/currency").unwrap_or(&Value::Null),
                "data": payload.get("data").unwrap_or(&Value::Null),
            });
            (seller, record_type, ts, normalized)
        }
        _ => {
            let seller = payload
                .get("seller_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| header(headers, "x-seller-id").map(str::to_string));
            let record_type = payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("event")
                .to_string();
            let ts = payload.get("timestamp_ms").and_then(Value::as_i64);
            (seller, record_type, ts, payload.clone())
        }
    };

    let seller_id = seller_hint
        .map(str::to_string)
        .or(seller)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            SourceError::InvalidPayload(format!("no seller id in {} payload", provider))
        })?;

    Ok(Record {
        id: content_id(&provider, payload),
        seller_id,
        record_type,
        timestamp_ms: timestamp_ms.unwrap_or_else(crate::now_ms),
        payload: normalized,
    })
}

#[async_trait::async_trait]
impl DataSourceAdapter for WebhookAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Webhook
    }

    fn name(&self) -> &str {
        "Webhook push buffer"
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
        let buffer = self.buffer.read().await;
        Ok(buffer.iter().filter(|r| matches(r, config)).cloned().collect())
    }

    /// Push sources have no remote endpoint to check.
    async fn health_check(&self) -> bool {
        true
    }

    async fn ingest(&self, records: Vec<Record>) -> Result<usize, SourceError> {
        let mut buffer = self.buffer.write().await;
        let count = records.len();
        for record in records {
            buffer.push(record);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shopify_payload_uses_headers() {
        let mut headers = HashMap::new();
        headers.insert("X-Shopify-Shop-Domain".into(), "acme.myshopify.com".into());
        headers.insert("X-Shopify-Topic".into(), "orders/paid".into());
        let payload = json!({
            "id": 42,
            "total_price": "19.90",
            "currency": "EUR",
            "created_at": "2024-03-01T12:00:00Z",
            "line_items": [{"sku": "A"}, {"sku": "B"}],
        });

        let record = normalize_payload("shopify", None, &payload, &headers).unwrap();
        assert_eq!(record.seller_id, "acme.myshopify.com");
        assert_eq!(record.record_type, "orders_paid");
        assert_eq!(record.timestamp_ms, 1_709_294_400_000);
        assert_eq!(record.value(), Some(19.9));
        assert_eq!(record.payload["line_items"], json!(2));
    }

    #[test]
    fn test_stripe_amount_is_converted_from_cents() {
        let payload = json!({
            "id": "evt_1",
            "type": "charge.succeeded",
            "created": 1_700_000_000,
            "account": "acct_9",
            "data": {"object": {"amount": 2500, "currency": "usd"}},
        });
        let record = normalize_payload("stripe", None, &payload, &HashMap::new()).unwrap();
        assert_eq!(record.seller_id, "acct_9");
        assert_eq!(record.record_type, "charge_succeeded");
        assert_eq!(record.timestamp_ms, 1_700_000_000_000);
        assert_eq!(record.value(), Some(25.0));
    }

    #[test]
    fn test_generic_payload_requires_a_seller() {
        let payload = json!({"type": "page_view", "value": 1});
        assert!(matches!(
            normalize_payload("custom", None, &payload, &HashMap::new()),
            Err(SourceError::InvalidPayload(_))
        ));
        let record = normalize_payload("custom", Some("s1"), &payload, &HashMap::new()).unwrap();
        assert_eq!(record.seller_id, "s1");
        assert_eq!(record.record_type, "page_view");
    }

    #[tokio::test]
    async fn test_redelivery_is_deduplicated() {
        let adapter = WebhookAdapter::new(16);
        let payload = json!({"seller_id": "s1", "timestamp_ms": 5, "value": 3.0});
        let headers = HashMap::new();

        let first = adapter
            .ingest_payload("generic", None, payload.clone(), &headers)
            .await
            .unwrap();
        let second = adapter
            .ingest_payload("generic", None, payload, &headers)
            .await
            .unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.record.id, second.record.id);

        let stats = adapter.stats().await;
        assert_eq!(stats.events_total, 1);
        assert_eq!(stats.duplicates_total, 1);
        assert_eq!(stats.buffered, 1);
        assert!(adapter.health_check().await);
    }
}
