//! Ownership and lifecycle of the per-resource reconcilers.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::health::HealthRegistry;
use crate::observability::TrackerMetrics;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::resources::ResourceKind;
use crate::store::Store;
use crate::watch::ApiClient;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("no active watch for resource {0}")]
    NotWatched(ResourceKind),
}

struct WatchHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Fans out one reconciler task per watched resource kind and coordinates
/// their shutdown.
pub struct Supervisor {
    client: Arc<ApiClient>,
    store: Arc<dyn Store>,
    namespace: String,
    config: ReconcilerConfig,
    health: HealthRegistry,
    metrics: TrackerMetrics,
    watches: HashMap<ResourceKind, WatchHandle>,
}

impl Supervisor {
    pub fn new(
        client: Arc<ApiClient>,
        store: Arc<dyn Store>,
        namespace: impl Into<String>,
        health: HealthRegistry,
    ) -> Self {
        Self {
            client,
            store,
            namespace: namespace.into(),
            config: ReconcilerConfig::default(),
            health,
            metrics: TrackerMetrics::new(),
            watches: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts watching a resource kind. Re-watching a kind that is
    /// already live is a no-op warning. With `initialize` set, the
    /// stored checkpoint is ignored for the first subscription.
    pub async fn watch(&mut self, kind: ResourceKind, initialize: bool) {
        if self.watches.contains_key(&kind) {
            warn!(resource = %kind, "Resource is already being watched; ignoring");
            return;
        }

        self.health.register(kind.as_str()).await;
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let reconciler = Reconciler::new(
            kind,
            self.namespace.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            self.config.clone(),
        );
        let health = self.health.clone();
        let task = tokio::spawn(async move {
            match reconciler.run(initialize, shutdown_rx).await {
                Ok(()) => info!(resource = %kind, "Reconciler stopped"),
                Err(e) => {
                    error!(resource = %kind, error = %e, "Reconciler failed");
                    health.set_unhealthy(kind.as_str(), e.to_string()).await;
                }
            }
        });
        self.watches.insert(kind, WatchHandle { shutdown, task });
        self.metrics.set_active_watches(self.watches.len() as i64);
        info!(resource = %kind, namespace = %self.namespace, "Watch started");
    }

    /// Stops the watch on one resource kind, waiting for its reconciler
    /// to finish.
    pub async fn stop(&mut self, kind: ResourceKind) -> Result<(), SupervisorError> {
        let handle = self
            .watches
            .remove(&kind)
            .ok_or(SupervisorError::NotWatched(kind))?;
        let _ = handle.shutdown.send(());
        if handle.task.await.is_err() {
            warn!(resource = %kind, "Reconciler task panicked during stop");
        }
        self.metrics.set_active_watches(self.watches.len() as i64);
        Ok(())
    }

    /// Whether a kind currently has a live watch.
    pub fn is_watching(&self, kind: ResourceKind) -> bool {
        self.watches.contains_key(&kind)
    }

    /// Stops every watch and consumes the supervisor; the store is
    /// released when the last reference drops.
    pub async fn destroy(mut self) {
        let kinds: Vec<ResourceKind> = self.watches.keys().copied().collect();
        for kind in kinds {
            let _ = self.stop(kind).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn supervisor() -> Supervisor {
        let client = Arc::new(ApiClient::new("127.0.0.1:1").unwrap());
        let store = Arc::new(MemoryStore::new());
        Supervisor::new(client, store, "apps", HealthRegistry::new())
    }

    #[tokio::test]
    async fn test_stop_unwatched_resource_is_an_error() {
        let mut sup = supervisor();
        assert_eq!(
            sup.stop(ResourceKind::Pods).await,
            Err(SupervisorError::NotWatched(ResourceKind::Pods))
        );
    }

    #[tokio::test]
    async fn test_watch_and_stop() {
        let mut sup = supervisor();
        sup.watch(ResourceKind::PersistentVolumeClaims, false).await;
        assert!(sup.is_watching(ResourceKind::PersistentVolumeClaims));

        sup.stop(ResourceKind::PersistentVolumeClaims).await.unwrap();
        assert!(!sup.is_watching(ResourceKind::PersistentVolumeClaims));
    }

    #[tokio::test]
    async fn test_watch_twice_is_noop() {
        let mut sup = supervisor();
        sup.watch(ResourceKind::Pods, false).await;
        sup.watch(ResourceKind::Pods, false).await;
        assert!(sup.is_watching(ResourceKind::Pods));
        sup.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_stops_all() {
        let mut sup = supervisor();
        for kind in ResourceKind::all() {
            sup.watch(kind, false).await;
        }
        sup.destroy().await;
    }
}
