//! # Result Cache
//!
//! Fingerprint-keyed store of finished query results. Entries are immutable
//! once written and simply expire; a miss or an expired entry always sends
//! the request back through compilation and execution.
//!
//! TTLs follow data volume: the more records a result was computed from,
//! the shorter it lives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use prism_core::QueryPlan;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

// =============================================================================
// Policy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_large_dataset_records")]
    pub large_dataset_records: usize,
    #[serde(default = "default_medium_dataset_records")]
    pub medium_dataset_records: usize,
    #[serde(default = "default_ttl_small_secs")]
    pub ttl_small_secs: u64,
    #[serde(default = "default_ttl_medium_secs")]
    pub ttl_medium_secs: u64,
    #[serde(default = "default_ttl_large_secs")]
    pub ttl_large_secs: u64,
}

fn default_max_entries() -> usize {
    10_000
}
fn default_large_dataset_records() -> usize {
    10_000
}
fn default_medium_dataset_records() -> usize {
    1_000
}
fn default_ttl_small_secs() -> u64 {
    900
}
fn default_ttl_medium_secs() -> u64 {
    300
}
fn default_ttl_large_secs() -> u64 {
    60
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            large_dataset_records: default_large_dataset_records(),
            medium_dataset_records: default_medium_dataset_records(),
            ttl_small_secs: default_ttl_small_secs(),
            ttl_medium_secs: default_ttl_medium_secs(),
            ttl_large_secs: default_ttl_large_secs(),
        }
    }
}

impl CachePolicy {
    pub fn ttl_for_volume(&self, records: usize) -> Duration {
        let secs = if records >= self.large_dataset_records {
            self.ttl_large_secs
        } else if records >= self.medium_dataset_records {
            self.ttl_medium_secs
        } else {
            self.ttl_small_secs
        };
        Duration::from_secs(secs)
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug)]
pub struct CacheEntry {
    pub payload: Value,
    pub plan: QueryPlan,
    pub created_at_ms: i64,
    /// `None` when the TTL runs past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct ResultCache {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    policy: CachePolicy,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl_for_volume(&self, records: usize) -> Duration {
        self.policy.ttl_for_volume(records)
    }

    /// Look up a live entry. Expired entries are removed on the way out.
    pub async fn get(&self, fingerprint: &str) -> Option<Arc<CacheEntry>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(fingerprint) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("Cache hit for '{}'", short(fingerprint));
                    return Some(entry.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("Cache miss for '{}'", short(fingerprint));
                    return None;
                }
            }
        }

        let mut entries = self.entries.write().await;
        if entries
            .get(fingerprint)
            .is_some_and(|entry| entry.is_expired(now))
        {
            entries.remove(fingerprint);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Cache entry '{}' expired", short(fingerprint));
        None
    }

    /// Store a result. When full, the entry closest to expiry makes room.
    pub async fn put(&self, fingerprint: String, payload: Value, plan: QueryPlan, ttl: Duration) {
        let now = Instant::now();
        let entry = Arc::new(CacheEntry {
            payload,
            plan,
            created_at_ms: crate::now_ms(),
            expires_at: now.checked_add(ttl),
        });

        let mut entries = self.entries.write().await;
        if !entries.contains_key(&fingerprint) && entries.len() >= self.policy.max_entries {
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| (e.expires_at.is_none(), e.expires_at))
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
                tracing::debug!("Cache full, evicted '{}'", short(&victim));
            }
        }
        if self.policy.max_entries > 0 {
            entries.insert(fingerprint, entry);
        }
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.entries.read().await.len(),
            max_entries: self.policy.max_entries,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}
