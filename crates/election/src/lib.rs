//! Primary election. Two strategies satisfy [PrimaryGetter]: the preferred
//! per-repository elector, and the legacy per-virtual-storage elector kept
//! for fleets which have not migrated yet.
//!
//! Election deliberately consumes only the health and store abstractions;
//! the node pool which owns connections is injected elsewhere, which keeps
//! the router ↔ election ↔ nodes dependencies acyclic.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use datastore::{DatastoreError, RepositoryStore, ShardPrimary, ShardPrimaryStore};
use nodes::HealthChecker;

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("no primary candidates for repository {virtual_storage:?}/{relative_path:?}")]
    NoCandidates {
        virtual_storage: String,
        relative_path: String,
    },
    #[error("no healthy nodes in virtual storage {0:?}")]
    NoHealthyNodes(String),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

/// Resolves the primary a mutator must be led by.
#[async_trait::async_trait]
pub trait PrimaryGetter: Send + Sync {
    async fn primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<String, ElectionError>;
}

/// Per-repository election. A primary stays in place while it is assigned
/// and globally healthy; otherwise a new one is elected among the healthy
/// assigned storages, preferring the smallest total generation lag across
/// the virtual storage. Demotion only happens once the incumbent's election
/// has aged past the failover timeout.
pub struct PerRepositoryElector {
    store: Arc<dyn RepositoryStore>,
    health: Arc<dyn HealthChecker>,
    failover_timeout: Duration,
}

impl PerRepositoryElector {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        health: Arc<dyn HealthChecker>,
        failover_timeout: Duration,
    ) -> Self {
        Self {
            store,
            health,
            failover_timeout,
        }
    }

    async fn elect(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<String, ElectionError> {
        let assignments = self
            .store
            .get_host_assignments(virtual_storage, relative_path)
            .await?;
        let healthy = self.health.healthy_storages(virtual_storage);

        let mut candidates: Vec<&String> = assignments
            .iter()
            .filter(|storage| healthy.contains(*storage))
            .collect();

        let candidate = if candidates.is_empty() {
            // Nothing assigned is healthy; fall back to the first assigned
            // storage rather than leaving the repository leaderless.
            assignments.first().ok_or_else(|| ElectionError::NoCandidates {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
            })?
        } else {
            let lag = self.store.storage_lag(virtual_storage).await?;
            candidates.sort_by_key(|storage| {
                (
                    lag.get(storage.as_str()).copied().unwrap_or(i64::MAX),
                    storage.to_string(),
                )
            });
            candidates[0]
        };

        let elected = self
            .store
            .elect_primary(
                virtual_storage,
                relative_path,
                candidate,
                self.failover_timeout,
            )
            .await?;

        if elected == *candidate {
            tracing::info!(
                virtual_storage,
                relative_path,
                primary = %elected,
                "elected repository primary"
            );
        }
        Ok(elected)
    }
}

#[async_trait::async_trait]
impl PrimaryGetter for PerRepositoryElector {
    async fn primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<String, ElectionError> {
        let record = self.store.get_primary(virtual_storage, relative_path).await?;
        let healthy = self.health.healthy_storages(virtual_storage);

        if let Some(incumbent) = record.storage {
            let assignments = self
                .store
                .get_host_assignments(virtual_storage, relative_path)
                .await?;
            if healthy.contains(&incumbent) && assignments.contains(&incumbent) {
                return Ok(incumbent);
            }
        }
        self.elect(virtual_storage, relative_path).await
    }
}

/// Legacy per-virtual-storage election: one primary leads every mutator of
/// the shard, and a failover leaves the shard read-only until the operator
/// accepts the dataloss.
pub struct PerVirtualStorageElector {
    store: Arc<dyn ShardPrimaryStore>,
    health: Arc<dyn HealthChecker>,
    proxy_name: String,
    failover_timeout: Duration,
}

impl PerVirtualStorageElector {
    pub fn new(
        store: Arc<dyn ShardPrimaryStore>,
        health: Arc<dyn HealthChecker>,
        proxy_name: String,
        failover_timeout: Duration,
    ) -> Self {
        tracing::warn!(
            "per-virtual-storage election is deprecated and will be removed; \
             migrate to per-repository elections"
        );
        Self {
            store,
            health,
            proxy_name,
            failover_timeout,
        }
    }

    /// The full shard record, including the read-only demotion state.
    pub async fn shard_primary(
        &self,
        virtual_storage: &str,
    ) -> Result<ShardPrimary, ElectionError> {
        let healthy = self.health.healthy_storages(virtual_storage);

        if let Some(incumbent) = self.store.get_shard_primary(virtual_storage).await? {
            if healthy.contains(&incumbent.node) {
                return Ok(incumbent);
            }
        }

        // The incumbent is gone or unhealthy: promote the first healthy
        // node. The store refuses the change while the incumbent's election
        // is still within the failover timeout.
        let candidate = first_healthy(&healthy).ok_or_else(|| {
            ElectionError::NoHealthyNodes(virtual_storage.to_string())
        })?;
        Ok(self
            .store
            .elect_shard_primary(
                virtual_storage,
                candidate,
                &self.proxy_name,
                self.failover_timeout,
            )
            .await?)
    }
}

fn first_healthy(healthy: &BTreeSet<String>) -> Option<&str> {
    healthy.iter().next().map(String::as_str)
}

#[async_trait::async_trait]
impl PrimaryGetter for PerVirtualStorageElector {
    async fn primary(
        &self,
        virtual_storage: &str,
        _relative_path: &str,
    ) -> Result<String, ElectionError> {
        Ok(self.shard_primary(virtual_storage).await?.node)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use datastore::{MemoryNodeStore, MemoryRepositoryStore};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeHealth(Mutex<BTreeSet<String>>);

    impl FakeHealth {
        fn new(storages: &[&str]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(
                storages.iter().map(|s| s.to_string()).collect(),
            )))
        }
        fn set(&self, storages: &[&str]) {
            *self.0.lock().unwrap() = storages.iter().map(|s| s.to_string()).collect();
        }
    }

    impl HealthChecker for FakeHealth {
        fn healthy_storages(&self, _virtual_storage: &str) -> BTreeSet<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn repository_store() -> Arc<MemoryRepositoryStore> {
        Arc::new(MemoryRepositoryStore::new(HashMap::from([(
            "default".to_string(),
            vec![
                "node-a".to_string(),
                "node-b".to_string(),
                "node-c".to_string(),
            ],
        )])))
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn healthy_assigned_incumbent_stays() {
        let store = repository_store();
        let health = FakeHealth::new(&["node-a", "node-b", "node-c"]);
        store
            .create_repository("default", "@repos/a", "node-a", &strings(&["node-b", "node-c"]), &[], true, true)
            .await
            .unwrap();

        let elector = PerRepositoryElector::new(
            store.clone(),
            health.clone(),
            Duration::from_secs(10),
        );
        assert_eq!(elector.primary("default", "@repos/a").await.unwrap(), "node-a");
    }

    #[tokio::test]
    async fn unhealthy_incumbent_is_replaced_by_least_lagging_candidate() {
        let store = repository_store();
        let health = FakeHealth::new(&["node-a", "node-b", "node-c"]);

        // node-b has been carried along by every write; node-c lags.
        store
            .create_repository("default", "@repos/a", "node-a", &strings(&["node-b", "node-c"]), &[], true, true)
            .await
            .unwrap();
        store
            .increment_generation("default", "@repos/a", "node-a", &strings(&["node-b"]))
            .await
            .unwrap();

        // Failover: node-a drops out of the healthy set.
        health.set(&["node-b", "node-c"]);

        // With a zero failover timeout the incumbent's election has expired.
        let elector = PerRepositoryElector::new(store.clone(), health.clone(), Duration::ZERO);
        assert_eq!(elector.primary("default", "@repos/a").await.unwrap(), "node-b");
    }

    #[tokio::test]
    async fn fresh_incumbent_is_not_demoted() {
        let store = repository_store();
        let health = FakeHealth::new(&["node-a", "node-b", "node-c"]);
        store
            .create_repository("default", "@repos/a", "node-a", &strings(&["node-b"]), &[], true, true)
            .await
            .unwrap();

        health.set(&["node-b", "node-c"]);

        // node-a is unhealthy but was elected moments ago: the election
        // stands until the failover timeout passes.
        let elector = PerRepositoryElector::new(
            store.clone(),
            health.clone(),
            Duration::from_secs(10),
        );
        assert_eq!(elector.primary("default", "@repos/a").await.unwrap(), "node-a");
    }

    #[tokio::test]
    async fn name_order_breaks_lag_ties() {
        let store = repository_store();
        let health = FakeHealth::new(&["node-b", "node-c"]);
        store
            .create_repository("default", "@repos/a", "node-a", &strings(&["node-b", "node-c"]), &[], false, true)
            .await
            .unwrap();

        let elector = PerRepositoryElector::new(store.clone(), health, Duration::ZERO);
        assert_eq!(elector.primary("default", "@repos/a").await.unwrap(), "node-b");
    }

    #[tokio::test]
    async fn all_candidates_unhealthy_falls_back_to_first_assigned() {
        let store = repository_store();
        let health = FakeHealth::new(&[]);
        store
            .create_repository("default", "@repos/a", "node-b", &strings(&["node-c"]), &[], false, true)
            .await
            .unwrap();

        let elector = PerRepositoryElector::new(store.clone(), health, Duration::ZERO);
        assert_eq!(elector.primary("default", "@repos/a").await.unwrap(), "node-b");
    }

    #[tokio::test]
    async fn legacy_elector_fails_over_to_a_healthy_node() {
        let nodes = Arc::new(MemoryNodeStore::new());
        let health = FakeHealth::new(&["node-a", "node-b"]);
        let elector = PerVirtualStorageElector::new(
            nodes.clone(),
            health.clone(),
            "proxy-1".to_string(),
            Duration::ZERO,
        );

        assert_eq!(elector.primary("default", "@repos/a").await.unwrap(), "node-a");

        health.set(&["node-b"]);
        let primary = elector.shard_primary("default").await.unwrap();
        assert_eq!(primary.node, "node-b");
        assert!(primary.demoted, "failover leaves the shard read-only");

        health.set(&[]);
        assert!(matches!(
            elector.shard_primary("default").await,
            Err(ElectionError::NoHealthyNodes(_))
        ));
    }
}
