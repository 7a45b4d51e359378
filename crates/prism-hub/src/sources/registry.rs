//! # Source Registry
//!
//! Explicit lookup from source type tag to adapter instance. Built once at
//! startup and passed to the coordinator by `Arc`, so tests can substitute
//! fakes. Registering a type twice replaces the earlier adapter.
//!
//! The health flag is the only runtime-mutated field. It is advisory and
//! last-writer-wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use prism_core::{DataSourceInfo, SourceType};
use tokio::sync::RwLock;

use super::DataSourceAdapter;

struct RegisteredAdapter {
    adapter: Arc<dyn DataSourceAdapter>,
    healthy: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct SourceRegistry {
    adapters: RwLock<HashMap<SourceType, RegisteredAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its source type, returning the one it replaced.
    pub async fn register(
        &self,
        adapter: Arc<dyn DataSourceAdapter>,
    ) -> Option<Arc<dyn DataSourceAdapter>> {
        let source_type = adapter.source_type();
        let entry = RegisteredAdapter {
            adapter: adapter.clone(),
            healthy: Arc::new(AtomicBool::new(true)),
        };
        let previous = self.adapters.write().await.insert(source_type, entry);
        match &previous {
            Some(old) => tracing::info!(
                "Source '{}' re-registered: '{}' replaces '{}'",
                source_type,
                adapter.id(),
                old.adapter.id()
            ),
            None => tracing::info!("Source '{}' registered as '{}'", source_type, adapter.id()),
        }
        previous.map(|old| old.adapter)
    }

    pub async fn resolve(&self, source_type: SourceType) -> Option<Arc<dyn DataSourceAdapter>> {
        self.adapters
            .read()
            .await
            .get(&source_type)
            .map(|entry| entry.adapter.clone())
    }

    pub async fn set_health(&self, source_type: SourceType, healthy: bool) {
        if let Some(entry) = self.adapters.read().await.get(&source_type) {
            entry.healthy.store(healthy, Ordering::Relaxed);
        }
    }

    pub async fn len(&self) -> usize {
        self.adapters.read().await.len()
    }

    /// Descriptors for every registered adapter, ordered by source type.
    pub async fn list(&self) -> Vec<DataSourceInfo> {
        let adapters = self.adapters.read().await;
        let mut infos: Vec<DataSourceInfo> = adapters
            .values()
            .map(|entry| entry.adapter.info(entry.healthy.load(Ordering::Relaxed)))
            .collect();
        infos.sort_by_key(|info| info.source_type);
        infos
    }

    /// Run every adapter's health check concurrently and store the results.
    pub async fn refresh_health(&self) -> Vec<(SourceType, bool)> {
        let entries: Vec<(SourceType, Arc<dyn DataSourceAdapter>, Arc<AtomicBool>)> = self
            .adapters
            .read()
            .await
            .iter()
            .map(|(ty, entry)| (*ty, entry.adapter.clone(), entry.healthy.clone()))
            .collect();

        let checks = entries.into_iter().map(|(ty, adapter, flag)| async move {
            let healthy = adapter.health_check().await;
            flag.store(healthy, Ordering::Relaxed);
            if !healthy {
                tracing::warn!("Source '{}' failed its health check", ty);
            }
            (ty, healthy)
        });

        let mut results = join_all(checks).await;
        results.sort_by_key(|(ty, _)| *ty);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::{health_of, FakeAdapter};

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = SourceRegistry::new();
        assert!(registry.resolve(SourceType::Hot).await.is_none());

        registry
            .register(Arc::new(FakeAdapter::new("hot-a", SourceType::Hot, 3)))
            .await;
        let adapter = registry.resolve(SourceType::Hot).await.unwrap();
        assert_eq!(adapter.id(), "hot-a");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = SourceRegistry::new();
        registry
            .register(Arc::new(FakeAdapter::new("first", SourceType::Cold, 1)))
            .await;
        let replaced = registry
            .register(Arc::new(FakeAdapter::new("second", SourceType::Cold, 1)))
            .await;

        assert_eq!(replaced.map(|a| a.id().to_string()), Some("first".into()));
        let current = registry.resolve(SourceType::Cold).await.unwrap();
        assert_eq!(current.id(), "second");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_health_is_last_writer_wins() {
        let registry = SourceRegistry::new();
        registry
            .register(Arc::new(FakeAdapter::new("hot", SourceType::Hot, 1)))
            .await;

        registry.set_health(SourceType::Hot, false).await;
        assert_eq!(health_of(&registry, SourceType::Hot).await, Some(false));
        registry.set_health(SourceType::Hot, true).await;
        assert_eq!(health_of(&registry, SourceType::Hot).await, Some(true));
        // Unregistered types are ignored.
        registry.set_health(SourceType::Cold, false).await;
        assert_eq!(health_of(&registry, SourceType::Cold).await, None);
    }

    #[tokio::test]
    async fn test_refresh_health_runs_every_check() {
        let registry = SourceRegistry::new();
        registry
            .register(Arc::new(FakeAdapter::new("hot", SourceType::Hot, 1)))
            .await;
        registry
            .register(Arc::new(
                FakeAdapter::new("cold", SourceType::Cold, 1).unhealthy(),
            ))
            .await;

        let results = registry.refresh_health().await;
        assert_eq!(
            results,
            vec![(SourceType::Hot, true), (SourceType::Cold, false)]
        );
        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        assert!(!listed[1].healthy);
    }
}
