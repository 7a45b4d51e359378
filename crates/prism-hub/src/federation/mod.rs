//! # Federated Fetch Coordinator
//!
//! Fans a SOURCE node's fetch out to its adapters concurrently. One slow or
//! failed adapter never blocks its siblings: every fetch runs under its own
//! timeout and every outcome is collected before the merge policy decides.
//!
//! - `Merge(Union)`: concatenate every successful result.
//! - `Merge(Join { key })`: keyed inner join against the first successful
//!   source (in configured order).
//! - `Partial { min_sources }`: union, but only if enough adapters succeeded.
//!
//! Adapter failures stay local; they only escalate as
//! [`QueryError::AllSourcesFailed`] or [`QueryError::InsufficientSources`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use prism_core::hash::canonical_json;
use prism_core::{
    FederationMode, MergeStrategy, QueryError, QueryResult, Record, SourceConfig, SourceType,
};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::sources::registry::SourceRegistry;
use crate::sources::{fetch_instrumented, DataSourceAdapter, SourceError};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Result of a SOURCE fetch, with per-adapter accounting.
#[derive(Debug, Clone, Serialize)]
pub struct FederatedFetch {
    pub records: Vec<Record>,
    pub succeeded: Vec<SourceType>,
    pub failed: Vec<SourceFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source: SourceType,
    pub error: String,
}

impl FederatedFetch {
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "records": self.records.len(),
            "sources_succeeded": self.succeeded.len(),
            "sources_failed": self.failed.len(),
            "failures": self.failed,
        })
    }
}

type Outcome = (SourceType, Result<Vec<Record>, SourceError>);

pub struct FederatedFetchCoordinator {
    registry: Arc<SourceRegistry>,
    fetch_timeout: Duration,
}

impl FederatedFetchCoordinator {
    pub fn new(registry: Arc<SourceRegistry>, fetch_timeout: Duration) -> Self {
        Self {
            registry,
            fetch_timeout,
        }
    }

    /// Dispatch by the SOURCE node's federation mode.
    pub async fn fetch(
        &self,
        config: &SourceConfig,
        cancel: &CancellationToken,
    ) -> QueryResult<FederatedFetch> {
        match &config.federation {
            FederationMode::Single => self.execute_single(config, cancel).await,
            FederationMode::Merge(strategy) => {
                self.execute_federated(config, strategy, cancel).await
            }
            FederationMode::Partial { min_sources } => {
                self.execute_with_partial_results(config, *min_sources, cancel)
                    .await
            }
        }
    }

    /// Exactly one adapter: the first configured source.
    pub async fn execute_single(
        &self,
        config: &SourceConfig,
        cancel: &CancellationToken,
    ) -> QueryResult<FederatedFetch> {
        let source = *config.sources.first().ok_or_else(|| {
            QueryError::InvalidRequest("SOURCE node names no data source".into())
        })?;
        let outcomes = self.fetch_all(&[source], config, cancel).await?;
        let fetch = split(outcomes);
        if fetch.succeeded.is_empty() {
            return Err(all_failed(&fetch));
        }
        Ok(fetch)
    }

    /// Fetch from every configured source and merge the successes. Fails
    /// only when no adapter succeeded.
    pub async fn execute_federated(
        &self,
        config: &SourceConfig,
        strategy: &MergeStrategy,
        cancel: &CancellationToken,
    ) -> QueryResult<FederatedFetch> {
        let outcomes = self.fetch_all(&config.sources, config, cancel).await?;
        let fetch = match strategy {
            MergeStrategy::Union => split(outcomes),
            MergeStrategy::Join { key } => {
                let (mut fetch, ordered) = partition(outcomes);
                fetch.records = keyed_join(&ordered, key);
                fetch
            }
        };
        if fetch.succeeded.is_empty() {
            return Err(all_failed(&fetch));
        }
        Ok(fetch)
    }

    /// Union of every success, provided at least `min_sources` succeeded.
    pub async fn execute_with_partial_results(
        &self,
        config: &SourceConfig,
        min_sources: usize,
        cancel: &CancellationToken,
    ) -> QueryResult<FederatedFetch> {
        let outcomes = self.fetch_all(&config.sources, config, cancel).await?;
        let fetch = split(outcomes);
        if fetch.succeeded.len() < min_sources {
            return Err(QueryError::InsufficientSources {
                succeeded: fetch.succeeded.len(),
                failed: fetch.failed.len(),
                required: min_sources,
            });
        }
        Ok(fetch)
    }

    /// Resolve, capability-filter and concurrently fetch. Outcomes come back
    /// in the order of `sources`. Every outcome overwrites the source's
    /// health flag.
    async fn fetch_all(
        &self,
        sources: &[SourceType],
        config: &SourceConfig,
        cancel: &CancellationToken,
    ) -> QueryResult<Vec<Outcome>> {
        let mut resolved: Vec<(SourceType, Arc<dyn DataSourceAdapter>)> =
            Vec::with_capacity(sources.len());
        for source in sources {
            let adapter = self
                .registry
                .resolve(*source)
                .await
                .ok_or(QueryError::UnknownDataSource(*source))?;
            resolved.push((*source, adapter));
        }

        let timeout = self.fetch_timeout;
        let fetches = resolved.into_iter().map(|(source, adapter)| async move {
            let missing: Vec<String> = config
                .required_capabilities
                .iter()
                .filter(|cap| !adapter.supports(**cap))
                .map(|cap| format!("{:?}", cap))
                .collect();
            if !missing.is_empty() {
                return (
                    source,
                    Err(SourceError::Unsupported {
                        adapter: adapter.id().to_string(),
                        operation: format!("required capabilities {}", missing.join(", ")),
                    }),
                );
            }

            let result =
                match tokio::time::timeout(timeout, fetch_instrumented(adapter.as_ref(), config, cancel))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        adapter.tracker().record_failure(timeout);
                        Err(SourceError::TimedOut {
                            adapter: adapter.id().to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                };
            (source, result)
        });

        let outcomes = join_all(fetches).await;

        for (source, result) in &outcomes {
            match result {
                Ok(records) => {
                    self.registry.set_health(*source, true).await;
                    tracing::debug!("Source '{}' returned {} records", source, records.len());
                }
                // Skipped for capability reasons, not a health signal.
                Err(SourceError::Unsupported { .. }) => {}
                Err(e) => {
                    self.registry.set_health(*source, false).await;
                    tracing::warn!("Source '{}' failed: {}", source, e);
                }
            }
        }
        Ok(outcomes)
    }
}

/// Union of every success, in source order.
fn split(outcomes: Vec<Outcome>) -> FederatedFetch {
    let (mut fetch, ordered) = partition(outcomes);
    fetch.records = ordered.into_iter().flat_map(|(_, records)| records).collect();
    fetch
}

/// Accounting plus each successful source's records, moved out in order.
/// The returned fetch has no records yet.
fn partition(outcomes: Vec<Outcome>) -> (FederatedFetch, Vec<(SourceType, Vec<Record>)>) {
    let mut fetch = FederatedFetch {
        records: Vec::new(),
        succeeded: Vec::new(),
        failed: Vec::new(),
    };
    let mut ordered = Vec::with_capacity(outcomes.len());
    for (source, result) in outcomes {
        match result {
            Ok(records) => {
                fetch.succeeded.push(source);
                ordered.push((source, records));
            }
            Err(e) => fetch.failed.push(SourceFailure {
                source,
                error: e.to_string(),
            }),
        }
    }
    (fetch, ordered)
}

fn all_failed(fetch: &FederatedFetch) -> QueryError {
    QueryError::AllSourcesFailed {
        attempted: fetch.failed.len(),
        errors: fetch
            .failed
            .iter()
            .map(|f| format!("{}: {}", f.source, f.error))
            .collect(),
    }
}

/// Inner join on `key`. Left side is the first successful source; each left
/// record survives only if every other source has a record with the same
/// key, and picks up their payload fields (left fields win on conflict).
/// Records without the key never join.
fn keyed_join(sources: &[(SourceType, Vec<Record>)], key: &str) -> Vec<Record> {
    let Some(((_, left), rest)) = sources.split_first() else {
        return Vec::new();
    };

    let indexes: Vec<HashMap<String, &Record>> = rest
        .iter()
        .map(|(_, records)| {
            let mut index = HashMap::new();
            for record in records {
                if let Some(k) = record.field(key) {
                    index.entry(canonical_json(&k)).or_insert(record);
                }
            }
            index
        })
        .collect();

    left.iter()
        .filter_map(|record| {
            let k = canonical_json(&record.field(key)?);
            let matches: Vec<&Record> = indexes
                .iter()
                .map(|index| index.get(&k).copied())
                .collect::<Option<Vec<_>>>()?;

            let mut joined = record.clone();
            if let Value::Object(target) = &mut joined.payload {
                for other in matches {
                    if let Value::Object(extra) = &other.payload {
                        for (field, value) in extra {
                            target.entry(field.clone()).or_insert_with(|| value.clone());
                        }
                    }
                }
            }
            Some(joined)
        })
        .collect()
}
