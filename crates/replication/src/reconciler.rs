use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use datastore::{ChangeType, ReplicationJob, ReplicationQueue, RepositoryStore};
use nodes::{HealthChecker, NodeSet};

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub interval: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    /// Repair jobs enqueued for outdated assigned replicas.
    pub updates: usize,
    /// Deletions enqueued for unassigned or orphaned replicas.
    pub deletions: usize,
}

/// Periodic sweep which repairs drift the write path missed: outdated
/// assigned replicas get update jobs from a consistent source, replicas
/// which are neither assigned nor the primary are deleted (at most one per
/// repository and run), and replicas of repositories which no longer exist
/// are removed.
///
/// Every decision is gated on the replication queue holding no active job
/// for the replica, so a sweep never races the jobs it enqueued before, and
/// completed-update dedup mops up the overlap of two concurrent sweeps.
pub struct Reconciler {
    nodes: Arc<NodeSet>,
    health: Arc<dyn HealthChecker>,
    queue: Arc<dyn ReplicationQueue>,
    store: Arc<dyn RepositoryStore>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        nodes: Arc<NodeSet>,
        health: Arc<dyn HealthChecker>,
        queue: Arc<dyn ReplicationQueue>,
        store: Arc<dyn RepositoryStore>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            nodes,
            health,
            queue,
            store,
            options,
        }
    }

    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.options.interval) => (),
                () = &mut shutdown => return,
            }
            match self.run_once().await {
                Ok(stats) if stats == ReconcilerStats::default() => (),
                Ok(stats) => tracing::info!(
                    updates = stats.updates,
                    deletions = stats.deletions,
                    "reconciliation enqueued repairs"
                ),
                Err(err) => tracing::error!(?err, "reconciliation failed"),
            }
        }
    }

    /// One full sweep over every virtual storage.
    pub async fn run_once(&self) -> Result<ReconcilerStats, datastore::DatastoreError> {
        let mut stats = ReconcilerStats::default();
        let virtual_storages: Vec<String> = self
            .nodes
            .virtual_storages()
            .map(str::to_string)
            .collect();

        for virtual_storage in virtual_storages {
            self.reconcile_virtual_storage(&virtual_storage, &mut stats)
                .await?;
        }
        Ok(stats)
    }

    async fn reconcile_virtual_storage(
        &self,
        virtual_storage: &str,
        stats: &mut ReconcilerStats,
    ) -> Result<(), datastore::DatastoreError> {
        let healthy = self.health.healthy_storages(virtual_storage);

        for info in self.store.list_repositories(virtual_storage).await? {
            let active = self
                .queue
                .active_events(virtual_storage, &info.relative_path)
                .await?;
            let involved = |storage: &str| {
                active.iter().any(|event| {
                    event.job.target_storage == storage
                        || event.job.source_storage.as_deref() == Some(storage)
                })
            };

            let consistent_sources: BTreeSet<&str> = info
                .replicas
                .iter()
                .filter(|replica| {
                    replica.generation == info.generation && healthy.contains(&replica.storage)
                })
                .map(|replica| replica.storage.as_str())
                .collect();

            // Outdated assigned replicas on healthy storages are brought
            // back up to date from a healthy consistent source.
            for replica in &info.replicas {
                if !replica.assigned
                    || replica.generation >= info.generation
                    || !healthy.contains(&replica.storage)
                {
                    continue;
                }
                let has_update = active.iter().any(|event| {
                    event.job.change == ChangeType::Update
                        && event.job.target_storage == replica.storage
                });
                if has_update {
                    continue;
                }
                let Some(source) = consistent_sources
                    .iter()
                    .find(|source| **source != replica.storage)
                else {
                    continue;
                };

                self.queue
                    .enqueue(ReplicationJob {
                        change: ChangeType::Update,
                        virtual_storage: virtual_storage.to_string(),
                        relative_path: info.relative_path.clone(),
                        source_storage: Some(source.to_string()),
                        target_storage: replica.storage.clone(),
                        params: None,
                    })
                    .await?;
                stats.updates += 1;
            }

            // One unassigned replica per repository and run may be dropped,
            // and only once no deletion is already in flight; an assignment
            // mistake cannot wipe more than one spare copy per sweep.
            let deletion_in_flight = active.iter().any(|event| {
                matches!(
                    event.job.change,
                    ChangeType::Delete | ChangeType::DeleteReplica
                )
            });
            if deletion_in_flight {
                continue;
            }
            if let Some(replica) = info.replicas.iter().find(|replica| {
                !replica.assigned
                    && replica.generation != datastore::GENERATION_UNKNOWN
                    && Some(replica.storage.as_str()) != info.primary.as_deref()
                    && !involved(&replica.storage)
            }) {
                self.queue
                    .enqueue(ReplicationJob {
                        change: ChangeType::DeleteReplica,
                        virtual_storage: virtual_storage.to_string(),
                        relative_path: info.relative_path.clone(),
                        source_storage: None,
                        target_storage: replica.storage.clone(),
                        params: None,
                    })
                    .await?;
                stats.deletions += 1;
            }
        }

        // Replicas whose repository record is gone are deleted from any
        // healthy storage still holding them.
        for (relative_path, storage) in self.store.orphaned_replicas(virtual_storage).await? {
            if !healthy.contains(&storage) {
                continue;
            }
            let active = self.queue.active_events(virtual_storage, &relative_path).await?;
            if active
                .iter()
                .any(|event| event.job.target_storage == storage)
            {
                continue;
            }

            self.queue
                .enqueue(ReplicationJob {
                    change: ChangeType::DeleteReplica,
                    virtual_storage: virtual_storage.to_string(),
                    relative_path,
                    source_storage: None,
                    target_storage: storage,
                    params: None,
                })
                .await?;
            stats.deletions += 1;
        }

        Ok(())
    }
}
