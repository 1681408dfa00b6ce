//! Routing: given an incoming call, decide which node or nodes receive it.
//!
//! Accessors go to a single suitable node. Mutators are led by the elected
//! primary; assigned storages which are both healthy and consistent vote
//! synchronously, everything else is repaired asynchronously through the
//! replication queue.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use datastore::{DatastoreError, RepositoryStore};
use election::{ElectionError, PerVirtualStorageElector, PrimaryGetter};
use nodes::{HealthChecker, Node, NodeError, NodeSet};
use rand::seq::{IteratorRandom, SliceRandom};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no healthy nodes in virtual storage {0:?}")]
    NoHealthyNodes(String),
    #[error("no healthy consistent node for repository {virtual_storage:?}/{relative_path:?}")]
    NoSuitableNode {
        virtual_storage: String,
        relative_path: String,
    },
    #[error("primary {primary:?} of {virtual_storage:?}/{relative_path:?} is not healthy")]
    PrimaryNotHealthy {
        virtual_storage: String,
        relative_path: String,
        primary: String,
    },
    #[error(
        "repository {virtual_storage:?}/{relative_path:?} is read-only: primary {primary:?} \
         is behind the latest generation"
    )]
    RepositoryReadOnly {
        virtual_storage: String,
        relative_path: String,
        primary: String,
    },
    #[error("primary {primary:?} of {virtual_storage:?}/{relative_path:?} is not assigned")]
    PrimaryUnassigned {
        virtual_storage: String,
        relative_path: String,
        primary: String,
    },
    #[error("virtual storage {0:?} is read-only after failover")]
    VirtualStorageReadOnly(String),
    #[error("storage-scoped mutators require the per-virtual-storage election strategy")]
    StorageMutatorsUnsupported,
    #[error(transparent)]
    Election(#[from] ElectionError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// A mutator route: the primary leads, secondaries vote synchronously, and
/// replication targets receive an async repair job afterwards.
#[derive(Debug, Clone)]
pub struct RepositoryMutatorRoute {
    pub primary: Node,
    pub secondaries: Vec<Node>,
    pub replication_targets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RepositoryCreationRoute {
    pub primary: Node,
    pub secondaries: Vec<Node>,
    pub replication_targets: Vec<String>,
    /// Non-zero when explicit assignments should be stored at creation.
    pub replication_factor: usize,
}

#[derive(Debug, Clone)]
pub struct StorageMutatorRoute {
    pub primary: Node,
    pub secondaries: Vec<Node>,
}

pub struct Router {
    nodes: Arc<NodeSet>,
    store: Arc<dyn RepositoryStore>,
    health: Arc<dyn HealthChecker>,
    primaries: Arc<dyn PrimaryGetter>,
    legacy: Option<Arc<PerVirtualStorageElector>>,
    default_replication_factor: usize,
}

impl Router {
    pub fn new(
        nodes: Arc<NodeSet>,
        store: Arc<dyn RepositoryStore>,
        health: Arc<dyn HealthChecker>,
        primaries: Arc<dyn PrimaryGetter>,
        default_replication_factor: usize,
    ) -> Self {
        Self {
            nodes,
            store,
            health,
            primaries,
            legacy: None,
            default_replication_factor,
        }
    }

    /// Enables the legacy storage-scoped mutator path.
    pub fn with_legacy_elector(mut self, elector: Arc<PerVirtualStorageElector>) -> Self {
        self.legacy = Some(elector);
        self
    }

    pub fn known_virtual_storage(&self, virtual_storage: &str) -> bool {
        self.nodes.contains_virtual_storage(virtual_storage)
    }

    /// Any globally healthy node of the virtual storage, picked at random.
    pub fn route_storage_accessor(&self, virtual_storage: &str) -> Result<Node, RouterError> {
        let healthy = self.health.healthy_storages(virtual_storage);
        let storage = healthy
            .iter()
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| RouterError::NoHealthyNodes(virtual_storage.to_string()))?;
        Ok(self.nodes.get(virtual_storage, storage)?.clone())
    }

    /// Storage-scoped mutators fan out to the legacy shard primary and every
    /// healthy secondary.
    pub async fn route_storage_mutator(
        &self,
        virtual_storage: &str,
    ) -> Result<StorageMutatorRoute, RouterError> {
        let Some(elector) = &self.legacy else {
            return Err(RouterError::StorageMutatorsUnsupported);
        };

        let shard = elector.shard_primary(virtual_storage).await?;
        if shard.demoted {
            return Err(RouterError::VirtualStorageReadOnly(
                virtual_storage.to_string(),
            ));
        }

        let healthy = self.health.healthy_storages(virtual_storage);
        let secondaries = healthy
            .iter()
            .filter(|storage| **storage != shard.node)
            .map(|storage| Ok(self.nodes.get(virtual_storage, storage)?.clone()))
            .collect::<Result<Vec<_>, RouterError>>()?;

        Ok(StorageMutatorRoute {
            primary: self.nodes.get(virtual_storage, &shard.node)?.clone(),
            secondaries,
        })
    }

    pub async fn route_repository_accessor(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        force_primary: bool,
    ) -> Result<Node, RouterError> {
        let healthy = self.health.healthy_storages(virtual_storage);

        if force_primary {
            let primary = self.primaries.primary(virtual_storage, relative_path).await?;
            if !healthy.contains(&primary) {
                return Err(RouterError::PrimaryNotHealthy {
                    virtual_storage: virtual_storage.to_string(),
                    relative_path: relative_path.to_string(),
                    primary,
                });
            }
            return Ok(self.nodes.get(virtual_storage, &primary)?.clone());
        }

        let consistent = self
            .store
            .get_consistent_storages(virtual_storage, relative_path)
            .await?;
        let candidates: Vec<&String> = consistent
            .iter()
            .filter(|storage| healthy.contains(*storage))
            .collect();
        let storage = candidates
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| RouterError::NoSuitableNode {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
            })?;
        Ok(self.nodes.get(virtual_storage, storage)?.clone())
    }

    pub async fn route_repository_mutator(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryMutatorRoute, RouterError> {
        let primary = self.primaries.primary(virtual_storage, relative_path).await?;

        let healthy = self.health.healthy_storages(virtual_storage);
        if !healthy.contains(&primary) {
            return Err(RouterError::PrimaryNotHealthy {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
                primary,
            });
        }

        let consistent = self
            .store
            .get_consistent_storages(virtual_storage, relative_path)
            .await?;
        if !consistent.contains(&primary) {
            // Accepting the write would fork history away from the replicas
            // holding the latest generation.
            return Err(RouterError::RepositoryReadOnly {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
                primary,
            });
        }

        let assignments = self
            .store
            .get_host_assignments(virtual_storage, relative_path)
            .await?;
        if !assignments.contains(&primary) {
            return Err(RouterError::PrimaryUnassigned {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
                primary,
            });
        }

        let mut secondaries = Vec::new();
        let mut replication_targets = Vec::new();
        for storage in assignments {
            if storage == primary {
                continue;
            }
            if healthy.contains(&storage) && consistent.contains(&storage) {
                secondaries.push(self.nodes.get(virtual_storage, &storage)?.clone());
            } else {
                replication_targets.push(storage);
            }
        }

        Ok(RepositoryMutatorRoute {
            primary: self.nodes.get(virtual_storage, &primary)?.clone(),
            secondaries,
            replication_targets,
        })
    }

    pub fn route_repository_creation(
        &self,
        virtual_storage: &str,
    ) -> Result<RepositoryCreationRoute, RouterError> {
        let healthy = self.health.healthy_storages(virtual_storage);
        let members = self.nodes.members(virtual_storage);

        let mut rng = rand::thread_rng();
        let primary = members
            .iter()
            .filter(|node| healthy.contains(&node.storage))
            .choose(&mut rng)
            .ok_or_else(|| RouterError::NoHealthyNodes(virtual_storage.to_string()))?;

        // Participants beyond the primary: a random sample of the configured
        // storages when a replication factor is set, everything otherwise.
        let participants: Vec<&Node> = {
            let rest: Vec<&Node> = members
                .iter()
                .filter(|node| node.storage != primary.storage)
                .collect();
            match self.default_replication_factor {
                0 => rest,
                factor => rest
                    .into_iter()
                    .choose_multiple(&mut rng, factor.saturating_sub(1)),
            }
        };

        let (secondaries, replication_targets) = partition_by_health(participants, &healthy);

        Ok(RepositoryCreationRoute {
            primary: primary.clone(),
            secondaries,
            replication_targets,
            replication_factor: self.default_replication_factor,
        })
    }
}

fn partition_by_health(
    participants: Vec<&Node>,
    healthy: &BTreeSet<String>,
) -> (Vec<Node>, Vec<String>) {
    let mut secondaries = Vec::new();
    let mut replication_targets = Vec::new();
    for node in participants {
        if healthy.contains(&node.storage) {
            secondaries.push(node.clone());
        } else {
            replication_targets.push(node.storage.clone());
        }
    }
    (secondaries, replication_targets)
}

/// Default failover timeout of primary elections.
pub const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod test {
    use super::*;
    use datastore::MemoryRepositoryStore;
    use election::PerRepositoryElector;
    use nodes::NodeConfig;
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

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn fixture(healthy: &[&str]) -> (Router, Arc<MemoryRepositoryStore>, Arc<FakeHealth>) {
        let nodes = Arc::new(
            NodeSet::dial(
                &["node-a", "node-b", "node-c"]
                    .into_iter()
                    .map(|storage| NodeConfig {
                        virtual_storage: "default".to_string(),
                        storage: storage.to_string(),
                        address: "http://127.0.0.1:1".to_string(),
                    })
                    .collect::<Vec<_>>(),
            )
            .unwrap(),
        );
        let store = Arc::new(MemoryRepositoryStore::new(HashMap::from([(
            "default".to_string(),
            strings(&["node-a", "node-b", "node-c"]),
        )])));
        let health = FakeHealth::new(healthy);
        let elector = Arc::new(PerRepositoryElector::new(
            store.clone(),
            health.clone(),
            DEFAULT_FAILOVER_TIMEOUT,
        ));
        let router = Router::new(nodes, store.clone(), health.clone(), elector, 3);
        (router, store, health)
    }

    #[tokio::test]
    async fn storage_accessor_requires_a_healthy_node() {
        let (router, _, health) = fixture(&["node-b"]);
        assert_eq!(router.route_storage_accessor("default").unwrap().storage, "node-b");

        health.set(&[]);
        assert!(matches!(
            router.route_storage_accessor("default"),
            Err(RouterError::NoHealthyNodes(_))
        ));
    }

    #[tokio::test]
    async fn repository_accessor_routes_to_healthy_consistent_nodes() {
        let (router, store, health) = fixture(&["node-a", "node-b", "node-c"]);
        store
            .create_repository("default", "@repos/a", "node-a", &strings(&["node-b"]), &strings(&["node-c"]), true, true)
            .await
            .unwrap();

        // node-c holds no copy; only the consistent pair may serve reads.
        for _ in 0..16 {
            let node = router
                .route_repository_accessor("default", "@repos/a", false)
                .await
                .unwrap();
            assert!(["node-a", "node-b"].contains(&node.storage.as_str()));
        }

        // Consistent nodes which are unhealthy are not eligible.
        health.set(&["node-c"]);
        assert!(matches!(
            router.route_repository_accessor("default", "@repos/a", false).await,
            Err(RouterError::NoSuitableNode { .. })
        ));
    }

    #[tokio::test]
    async fn forced_primary_reads_require_a_healthy_primary() {
        let (router, store, health) = fixture(&["node-a", "node-b", "node-c"]);
        store
            .create_repository("default", "@repos/a", "node-a", &strings(&["node-b"]), &[], true, true)
            .await
            .unwrap();

        let node = router
            .route_repository_accessor("default", "@repos/a", true)
            .await
            .unwrap();
        assert_eq!(node.storage, "node-a");

        // A fresh but unhealthy primary fails the forced-primary read
        // rather than silently serving from a secondary.
        health.set(&["node-b", "node-c"]);
        assert!(matches!(
            router.route_repository_accessor("default", "@repos/a", true).await,
            Err(RouterError::PrimaryNotHealthy { .. })
        ));
    }

    #[tokio::test]
    async fn mutator_route_partitions_assignments() {
        let (router, store, health) = fixture(&["node-a", "node-b", "node-c"]);
        store
            .create_repository("default", "@repos/a", "node-a", &strings(&["node-b"]), &strings(&["node-c"]), true, true)
            .await
            .unwrap();

        // node-c is healthy but inconsistent: it must not vote.
        let route = router
            .route_repository_mutator("default", "@repos/a")
            .await
            .unwrap();
        assert_eq!(route.primary.storage, "node-a");
        assert_eq!(
            route.secondaries.iter().map(|n| n.storage.as_str()).collect::<Vec<_>>(),
            vec!["node-b"]
        );
        assert_eq!(route.replication_targets, strings(&["node-c"]));

        // An unhealthy consistent secondary becomes a replication target.
        health.set(&["node-a", "node-c"]);
        let route = router
            .route_repository_mutator("default", "@repos/a")
            .await
            .unwrap();
        assert!(route.secondaries.is_empty());
        assert_eq!(route.replication_targets, strings(&["node-b", "node-c"]));
    }

    #[tokio::test]
    async fn outdated_primary_blocks_writes() {
        let (router, store, _) = fixture(&["node-a", "node-b", "node-c"]);
        store
            .create_repository("default", "@repos/a", "node-a", &strings(&["node-b"]), &[], true, true)
            .await
            .unwrap();
        store
            .increment_generation("default", "@repos/a", "node-a", &strings(&["node-b"]))
            .await
            .unwrap();

        // The primary is authoritatively reset behind node-b.
        store.set_generation("default", "@repos/a", "node-a", 0).await.unwrap();

        assert!(matches!(
            router.route_repository_mutator("default", "@repos/a").await,
            Err(RouterError::RepositoryReadOnly { .. })
        ));
    }

    #[tokio::test]
    async fn creation_spreads_over_healthy_and_unhealthy_storages() {
        let (router, _, health) = fixture(&["node-a", "node-b"]);

        let route = router.route_repository_creation("default").unwrap();
        assert!(["node-a", "node-b"].contains(&route.primary.storage.as_str()));
        assert_eq!(route.secondaries.len() + route.replication_targets.len(), 2);
        assert_eq!(route.replication_targets, strings(&["node-c"]));

        health.set(&[]);
        assert!(matches!(
            router.route_repository_creation("default"),
            Err(RouterError::NoHealthyNodes(_))
        ));
    }

    #[tokio::test]
    async fn storage_mutators_require_the_legacy_elector() {
        let (router, _, _) = fixture(&["node-a"]);
        assert!(matches!(
            router.route_storage_mutator("default").await,
            Err(RouterError::StorageMutatorsUnsupported)
        ));
    }
}
