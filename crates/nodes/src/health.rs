use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use datastore::NodeStatusStore;
use proto::health::{HealthCheckRequest, HealthClient, ServingStatus};

use crate::NodeSet;

/// Consumers of the consensus healthy set. Kept narrow so routing and
/// election depend on health observations alone, not on the node pool.
pub trait HealthChecker: Send + Sync {
    /// Storages of `virtual_storage` which a quorum of active proxy
    /// instances currently considers healthy.
    fn healthy_storages(&self, virtual_storage: &str) -> BTreeSet<String>;
}

/// The most recent consensus view, refreshed by [HealthManager] and shared
/// with every routing decision.
#[derive(Clone, Default)]
pub struct HealthSnapshot {
    inner: Arc<RwLock<HashMap<String, BTreeSet<String>>>>,
}

impl HealthSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, healthy: HashMap<String, BTreeSet<String>>) {
        *self.inner.write().unwrap() = healthy;
    }
}

impl HealthChecker for HealthSnapshot {
    fn healthy_storages(&self, virtual_storage: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .unwrap()
            .get(virtual_storage)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct HealthOptions {
    /// Steady-state probe interval.
    pub tick: Duration,
    /// Shorter first interval, so a starting proxy converges quickly.
    pub bootstrap_tick: Duration,
    /// Upper bound on any single probe.
    pub probe_timeout: Duration,
    /// How recently a storage must have been seen active to count as
    /// locally healthy.
    pub health_window: Duration,
    /// How recently a proxy instance must have probed to count towards the
    /// quorum.
    pub activity_window: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(3),
            bootstrap_tick: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            health_window: Duration::from_secs(10),
            activity_window: Duration::from_secs(60),
        }
    }
}

/// Probes every node on a timer, records the outcomes durably, and refreshes
/// the consensus snapshot.
pub struct HealthManager {
    proxy_name: String,
    nodes: Arc<NodeSet>,
    store: Arc<dyn NodeStatusStore>,
    options: HealthOptions,
    snapshot: HealthSnapshot,
}

impl HealthManager {
    pub fn new(
        proxy_name: String,
        nodes: Arc<NodeSet>,
        store: Arc<dyn NodeStatusStore>,
        options: HealthOptions,
    ) -> Self {
        Self {
            proxy_name,
            nodes,
            store,
            options,
            snapshot: HealthSnapshot::new(),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.clone()
    }

    /// Runs probe rounds until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        let mut tick = self.options.bootstrap_tick;
        loop {
            tokio::select! {
                () = tokio::time::sleep(tick) => (),
                () = &mut shutdown => return,
            }
            tick = self.options.tick;

            self.check_round().await;
        }
    }

    /// One probe round: every node concurrently, each bounded by the probe
    /// timeout; then refresh the consensus snapshot from the store.
    pub async fn check_round(&self) {
        let probes = self.nodes.iter().map(|node| {
            let store = self.store.clone();
            let proxy_name = self.proxy_name.clone();
            let timeout = self.options.probe_timeout;
            let node = node.clone();

            async move {
                let active = match tokio::time::timeout(timeout, probe(&node)).await {
                    Ok(Ok(status)) => status == ServingStatus::Serving as i32,
                    Ok(Err(err)) => {
                        tracing::debug!(
                            virtual_storage = %node.virtual_storage,
                            storage = %node.storage,
                            %err,
                            "health probe failed"
                        );
                        false
                    }
                    Err(_elapsed) => false,
                };

                if let Err(err) = store
                    .update_status(&proxy_name, &node.virtual_storage, &node.storage, active)
                    .await
                {
                    tracing::warn!(?err, "failed to record node status");
                }
            }
        });
        futures::future::join_all(probes).await;

        match self
            .store
            .healthy_storages(self.options.health_window, self.options.activity_window)
            .await
        {
            Ok(healthy) => self.snapshot.replace(healthy),
            Err(err) => {
                // Keep serving the previous snapshot rather than flapping
                // every route to unhealthy.
                tracing::warn!(?err, "failed to refresh consensus health view");
            }
        }
    }
}

async fn probe(node: &crate::Node) -> Result<i32, tonic::Status> {
    let mut client = HealthClient::new(node.channel.clone());
    let response = client
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await?;
    Ok(response.into_inner().status)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::NodeConfig;
    use datastore::MemoryNodeStore;

    #[tokio::test]
    async fn failed_probes_mark_storages_unhealthy() {
        // Port 1 refuses connections; the probe fails fast.
        let nodes = Arc::new(
            NodeSet::dial(&[NodeConfig {
                virtual_storage: "default".to_string(),
                storage: "node-a".to_string(),
                address: "http://127.0.0.1:1".to_string(),
            }])
            .unwrap(),
        );
        let store = Arc::new(MemoryNodeStore::new());
        let manager = HealthManager::new(
            "proxy-1".to_string(),
            nodes,
            store.clone(),
            HealthOptions::default(),
        );

        manager.check_round().await;

        // The probe attempt was recorded, but the storage never counted as
        // active, so the consensus view stays empty.
        assert!(manager
            .snapshot()
            .healthy_storages("default")
            .is_empty());
    }

    #[tokio::test]
    async fn snapshot_reflects_the_store_consensus() {
        let nodes = Arc::new(NodeSet::dial(&[]).unwrap());
        let store = Arc::new(MemoryNodeStore::new());
        store
            .update_status("proxy-1", "default", "node-a", true)
            .await
            .unwrap();

        let manager = HealthManager::new(
            "proxy-2".to_string(),
            nodes,
            store,
            HealthOptions::default(),
        );
        manager.check_round().await;

        assert_eq!(
            manager.snapshot().healthy_storages("default"),
            BTreeSet::from(["node-a".to_string()])
        );
    }
}
