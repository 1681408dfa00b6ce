use std::sync::Arc;
use std::time::Duration;

use datastore::{
    ChangeType, DatastoreError, JobState, ReplicationEvent, ReplicationQueue, RepositoryStore,
};
use futures::FutureExt;
use nodes::{HealthChecker, Node, NodeSet};

use crate::{ReplicationError, Replicator};

static JOBS: std::sync::LazyLock<prometheus::IntCounterVec> = std::sync::LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "palisade_replication_jobs_total",
        "Processed replication jobs by change type and final state.",
        &["change", "state"]
    )
    .expect("metric registration is infallible at startup")
});

static DELAY: std::sync::LazyLock<prometheus::HistogramVec> = std::sync::LazyLock::new(|| {
    prometheus::register_histogram_vec!(
        "palisade_replication_delay_seconds",
        "Time between enqueueing a job and finishing it.",
        &["change"],
        prometheus::exponential_buckets(0.1, 2.0, 12).unwrap()
    )
    .expect("metric registration is infallible at startup")
});

#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub batch_size: usize,
    /// How often in-progress events are touched to keep their ownership.
    pub health_interval: Duration,
    /// Idle backoff bounds: start doubles up to the cap, and resets on the
    /// first non-empty batch.
    pub backoff_start: Duration,
    pub backoff_cap: Duration,
    /// Events untouched for longer than this are released to other
    /// instances.
    pub stale_after: Duration,
    pub reaper_interval: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            health_interval: Duration::from_secs(5),
            backoff_start: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

/// Drains the replication queue: one worker per `(virtual storage, target
/// storage)` pair, so jobs for different targets proceed in parallel while
/// the queue's lock ids serialize each individual replica.
pub struct ReplicationManager {
    nodes: Arc<NodeSet>,
    health: Arc<dyn HealthChecker>,
    queue: Arc<dyn ReplicationQueue>,
    store: Arc<dyn RepositoryStore>,
    replicator: Arc<dyn Replicator>,
    options: ReplicationOptions,
}

impl ReplicationManager {
    pub fn new(
        nodes: Arc<NodeSet>,
        health: Arc<dyn HealthChecker>,
        queue: Arc<dyn ReplicationQueue>,
        store: Arc<dyn RepositoryStore>,
        replicator: Arc<dyn Replicator>,
        options: ReplicationOptions,
    ) -> Self {
        Self {
            nodes,
            health,
            queue,
            store,
            replicator,
            options,
        }
    }

    /// Runs every worker and the stale reaper until `shutdown` resolves.
    pub async fn serve(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
        let mut workers = Vec::new();
        for node in self.nodes.iter() {
            let manager = self.clone();
            let virtual_storage = node.virtual_storage.clone();
            let storage = node.storage.clone();
            workers.push(async move { manager.worker_loop(&virtual_storage, &storage).await });
        }

        let reaper = self.reaper_loop();

        tokio::select! {
            () = futures::future::join_all(workers).map(|_| ()) => (),
            () = reaper => (),
            () = shutdown => (),
        }
    }

    async fn worker_loop(&self, virtual_storage: &str, storage: &str) {
        let mut backoff = self.options.backoff_start;
        loop {
            // Only dequeue for targets the fleet currently agrees are
            // healthy; jobs for a down node wait for its return.
            let healthy = self
                .health
                .healthy_storages(virtual_storage)
                .contains(storage);

            let processed = if healthy {
                self.process_once(virtual_storage, storage).await
            } else {
                0
            };

            if processed > 0 {
                backoff = self.options.backoff_start;
                continue;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.options.backoff_cap);
        }
    }

    /// Dequeues and processes one batch. Returns the number of events
    /// handled.
    pub async fn process_once(&self, virtual_storage: &str, storage: &str) -> usize {
        let events = match self
            .queue
            .dequeue(virtual_storage, storage, self.options.batch_size)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                tracing::error!(virtual_storage, storage, ?err, "failed to dequeue events");
                return 0;
            }
        };
        if events.is_empty() {
            return 0;
        }
        let count = events.len();
        let ids: Vec<i64> = events.iter().map(|event| event.id).collect();

        // Touch the batch periodically so a crash releases it to the stale
        // reaper rather than wedging the lock ids forever.
        let keepalive = async {
            loop {
                tokio::time::sleep(self.options.health_interval).await;
                if let Err(err) = self.queue.touch(&ids).await {
                    tracing::warn!(?err, "failed to touch in-progress events");
                }
            }
        };

        tokio::select! {
            () = async {
                for event in events {
                    self.process_event(event).await;
                }
            } => (),
            () = keepalive => unreachable!("keepalive never completes"),
        }
        count
    }

    async fn process_event(&self, event: ReplicationEvent) {
        let change = event.job.change;
        let delay = chrono::Utc::now()
            .signed_duration_since(event.created_at)
            .num_milliseconds() as f64
            / 1000.0;

        let state = match self.apply(&event).await {
            Ok(()) => JobState::Completed,
            Err(err) => {
                tracing::warn!(
                    id = event.id,
                    change = change.as_str(),
                    virtual_storage = %event.job.virtual_storage,
                    relative_path = %event.job.relative_path,
                    target = %event.job.target_storage,
                    ?err,
                    "replication job failed"
                );
                if event.attempt <= 0 {
                    JobState::Dead
                } else {
                    JobState::Failed
                }
            }
        };

        JOBS.with_label_values(&[change.as_str(), state.as_str()]).inc();
        DELAY.with_label_values(&[change.as_str()]).observe(delay.max(0.0));

        if let Err(err) = self.queue.acknowledge(state, &[event.id]).await {
            tracing::error!(id = event.id, ?err, "failed to acknowledge replication job");
        }
    }

    async fn apply(&self, event: &ReplicationEvent) -> Result<(), ReplicationError> {
        let job = &event.job;
        let target = self.nodes.get(&job.virtual_storage, &job.target_storage)?;

        match job.change {
            ChangeType::Update | ChangeType::Create => self.apply_update(event, target).await,
            ChangeType::Delete | ChangeType::DeleteReplica => {
                self.replicator.destroy(target, &job.relative_path).await?;
                match self
                    .store
                    .delete_replica(&job.virtual_storage, &job.relative_path, &job.target_storage)
                    .await
                {
                    Ok(()) | Err(DatastoreError::NoRowsAffected) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            ChangeType::Rename => {
                let new_relative_path = job
                    .params
                    .as_ref()
                    .and_then(|params| params.get("relative_path"))
                    .and_then(|value| value.as_str())
                    .ok_or_else(|| {
                        ReplicationError::MalformedJob(
                            "rename job without a relative_path parameter".to_string(),
                        )
                    })?;
                self.replicator
                    .rename(target, &job.relative_path, new_relative_path)
                    .await
            }
            change => self.replicator.maintain(change, target, &job.relative_path).await,
        }
    }

    async fn apply_update(
        &self,
        event: &ReplicationEvent,
        target: &Node,
    ) -> Result<(), ReplicationError> {
        let job = &event.job;
        let source_storage = job.source_storage.as_deref().ok_or_else(|| {
            ReplicationError::MalformedJob("update job without a source storage".to_string())
        })?;
        let source = self.nodes.get(&job.virtual_storage, source_storage)?;

        let generation = match self
            .store
            .get_replicated_generation(
                &job.virtual_storage,
                &job.relative_path,
                source_storage,
                &job.target_storage,
            )
            .await
        {
            Ok(generation) => generation,
            Err(DatastoreError::DowngradeAttempted {
                current, attempted, ..
            }) => {
                // The target already caught up (or ran ahead) through some
                // other job; replicating now would rewind it.
                tracing::info!(
                    virtual_storage = %job.virtual_storage,
                    relative_path = %job.relative_path,
                    target = %job.target_storage,
                    current,
                    attempted,
                    "skipping replication which would downgrade the target"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        // A source which lost its copy cannot serve the update; drop the
        // target's record so the repository is not reported consistent on
        // the strength of a replica nobody can fetch.
        if !self.replicator.repository_exists(source, &job.relative_path).await? {
            tracing::warn!(
                virtual_storage = %job.virtual_storage,
                relative_path = %job.relative_path,
                source = %source_storage,
                "replication source does not hold the repository"
            );
            match self
                .store
                .delete_replica(&job.virtual_storage, &job.relative_path, &job.target_storage)
                .await
            {
                Ok(()) | Err(DatastoreError::NoRowsAffected) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }

        self.replicator.replicate(target, &job.relative_path, source).await?;

        if generation != datastore::GENERATION_UNKNOWN {
            self.store
                .set_generation(
                    &job.virtual_storage,
                    &job.relative_path,
                    &job.target_storage,
                    generation,
                )
                .await?;
        }
        Ok(())
    }

    async fn reaper_loop(&self) {
        loop {
            tokio::time::sleep(self.options.reaper_interval).await;
            match self.queue.acknowledge_stale(self.options.stale_after).await {
                Ok(0) => (),
                Ok(swept) => tracing::info!(swept, "released stale in-progress events"),
                Err(err) => tracing::error!(?err, "failed to sweep stale events"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use datastore::{MemoryQueue, MemoryRepositoryStore, ReplicationJob};
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::sync::Mutex;

    struct FakeHealth;

    impl HealthChecker for FakeHealth {
        fn healthy_storages(&self, _virtual_storage: &str) -> BTreeSet<String> {
            ["node-a", "node-b", "node-c"].map(str::to_string).into_iter().collect()
        }
    }

    #[derive(Default)]
    struct MockReplicator {
        replicated: Mutex<Vec<(String, String, String)>>,
        destroyed: Mutex<Vec<(String, String)>>,
        renamed: Mutex<Vec<(String, String, String)>>,
        maintained: Mutex<Vec<(ChangeType, String)>>,
        missing_sources: Mutex<HashSet<String>>,
        fail_targets: Mutex<HashSet<String>>,
    }

    #[async_trait::async_trait]
    impl Replicator for MockReplicator {
        async fn replicate(
            &self,
            target: &Node,
            relative_path: &str,
            source: &Node,
        ) -> Result<(), ReplicationError> {
            if self.fail_targets.lock().unwrap().contains(&target.storage) {
                return Err(ReplicationError::Grpc(tonic::Status::unavailable(
                    "node is down",
                )));
            }
            self.replicated.lock().unwrap().push((
                target.storage.clone(),
                relative_path.to_string(),
                source.storage.clone(),
            ));
            Ok(())
        }

        async fn destroy(&self, target: &Node, relative_path: &str) -> Result<(), ReplicationError> {
            self.destroyed
                .lock()
                .unwrap()
                .push((target.storage.clone(), relative_path.to_string()));
            Ok(())
        }

        async fn rename(
            &self,
            target: &Node,
            relative_path: &str,
            new_relative_path: &str,
        ) -> Result<(), ReplicationError> {
            self.renamed.lock().unwrap().push((
                target.storage.clone(),
                relative_path.to_string(),
                new_relative_path.to_string(),
            ));
            Ok(())
        }

        async fn maintain(
            &self,
            change: ChangeType,
            target: &Node,
            _relative_path: &str,
        ) -> Result<(), ReplicationError> {
            self.maintained.lock().unwrap().push((change, target.storage.clone()));
            Ok(())
        }

        async fn repository_exists(
            &self,
            node: &Node,
            _relative_path: &str,
        ) -> Result<bool, ReplicationError> {
            Ok(!self.missing_sources.lock().unwrap().contains(&node.storage))
        }
    }

    struct Fixture {
        manager: ReplicationManager,
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryRepositoryStore>,
        replicator: Arc<MockReplicator>,
    }

    fn fixture() -> Fixture {
        let nodes = Arc::new(
            NodeSet::dial(
                &["node-a", "node-b", "node-c"]
                    .into_iter()
                    .map(|storage| nodes::NodeConfig {
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
            ["node-a", "node-b", "node-c"].map(str::to_string).to_vec(),
        )])));
        let queue = Arc::new(MemoryQueue::new());
        let replicator = Arc::new(MockReplicator::default());
        let manager = ReplicationManager::new(
            nodes,
            Arc::new(FakeHealth),
            queue.clone(),
            store.clone(),
            replicator.clone(),
            ReplicationOptions::default(),
        );
        Fixture {
            manager,
            queue,
            store,
            replicator,
        }
    }

    fn update_job(path: &str, source: &str, target: &str) -> ReplicationJob {
        ReplicationJob {
            change: ChangeType::Update,
            virtual_storage: "default".to_string(),
            relative_path: path.to_string(),
            source_storage: Some(source.to_string()),
            target_storage: target.to_string(),
            params: None,
        }
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn completed_update_records_the_replicated_generation() {
        let fixture = fixture();
        fixture
            .store
            .create_repository("default", "@repos/a", "node-a", &[], &strings(&["node-b"]), true, true)
            .await
            .unwrap();
        fixture
            .store
            .increment_generation("default", "@repos/a", "node-a", &[])
            .await
            .unwrap();

        fixture
            .queue
            .enqueue(update_job("@repos/a", "node-a", "node-b"))
            .await
            .unwrap();
        assert_eq!(fixture.manager.process_once("default", "node-b").await, 1);

        assert_eq!(
            *fixture.replicator.replicated.lock().unwrap(),
            vec![(
                "node-b".to_string(),
                "@repos/a".to_string(),
                "node-a".to_string()
            )]
        );
        assert_eq!(
            fixture.store.get_generation("default", "@repos/a", "node-b").await.unwrap(),
            1
        );

        // Nothing left in the queue for this target.
        assert_eq!(fixture.manager.process_once("default", "node-b").await, 0);
    }

    #[tokio::test]
    async fn failing_jobs_retry_and_die() {
        let fixture = fixture();
        fixture
            .store
            .create_repository("default", "@repos/a", "node-a", &[], &strings(&["node-b"]), true, true)
            .await
            .unwrap();
        fixture
            .replicator
            .fail_targets
            .lock()
            .unwrap()
            .insert("node-b".to_string());

        fixture
            .queue
            .enqueue(update_job("@repos/a", "node-a", "node-b"))
            .await
            .unwrap();

        // Three attempts, then the job is dead and stops surfacing.
        for _ in 0..3 {
            assert_eq!(fixture.manager.process_once("default", "node-b").await, 1);
        }
        assert_eq!(fixture.manager.process_once("default", "node-b").await, 0);
        assert!(fixture.replicator.replicated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_from_a_missing_source_drops_the_replica_record() {
        let fixture = fixture();
        fixture
            .store
            .create_repository("default", "@repos/a", "node-a", &[], &strings(&["node-b"]), true, true)
            .await
            .unwrap();
        fixture
            .replicator
            .missing_sources
            .lock()
            .unwrap()
            .insert("node-a".to_string());

        fixture
            .queue
            .enqueue(update_job("@repos/a", "node-a", "node-b"))
            .await
            .unwrap();
        assert_eq!(fixture.manager.process_once("default", "node-b").await, 1);

        // Completed without replicating; the invalid record is gone.
        assert!(fixture.replicator.replicated.lock().unwrap().is_empty());
        assert_eq!(fixture.manager.process_once("default", "node-b").await, 0);
        assert_eq!(
            fixture.store.get_generation("default", "@repos/a", "node-b").await.unwrap(),
            datastore::GENERATION_UNKNOWN
        );
    }

    #[tokio::test]
    async fn downgrades_are_skipped_as_already_done() {
        let fixture = fixture();
        fixture
            .store
            .create_repository("default", "@repos/a", "node-b", &[], &[], true, true)
            .await
            .unwrap();
        // The target is ahead of the source.
        fixture
            .store
            .increment_generation("default", "@repos/a", "node-b", &[])
            .await
            .unwrap();

        fixture
            .queue
            .enqueue(update_job("@repos/a", "node-a", "node-b"))
            .await
            .unwrap();
        assert_eq!(fixture.manager.process_once("default", "node-b").await, 1);

        assert!(fixture.replicator.replicated.lock().unwrap().is_empty());
        assert_eq!(fixture.manager.process_once("default", "node-b").await, 0);
    }

    #[tokio::test]
    async fn deletes_and_renames_dispatch_to_the_replicator() {
        let fixture = fixture();
        fixture
            .store
            .create_repository("default", "@repos/a", "node-a", &strings(&["node-b"]), &[], true, true)
            .await
            .unwrap();

        fixture
            .queue
            .enqueue(ReplicationJob {
                change: ChangeType::DeleteReplica,
                virtual_storage: "default".to_string(),
                relative_path: "@repos/a".to_string(),
                source_storage: None,
                target_storage: "node-b".to_string(),
                params: None,
            })
            .await
            .unwrap();
        assert_eq!(fixture.manager.process_once("default", "node-b").await, 1);
        assert_eq!(
            *fixture.replicator.destroyed.lock().unwrap(),
            vec![("node-b".to_string(), "@repos/a".to_string())]
        );
        assert_eq!(
            fixture.store.get_generation("default", "@repos/a", "node-b").await.unwrap(),
            datastore::GENERATION_UNKNOWN
        );

        fixture
            .queue
            .enqueue(ReplicationJob {
                change: ChangeType::Rename,
                virtual_storage: "default".to_string(),
                relative_path: "@repos/a".to_string(),
                source_storage: None,
                target_storage: "node-a".to_string(),
                params: Some(serde_json::json!({ "relative_path": "@repos/b" })),
            })
            .await
            .unwrap();
        assert_eq!(fixture.manager.process_once("default", "node-a").await, 1);
        assert_eq!(
            *fixture.replicator.renamed.lock().unwrap(),
            vec![(
                "node-a".to_string(),
                "@repos/a".to_string(),
                "@repos/b".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn malformed_jobs_fail_without_dispatching() {
        let fixture = fixture();
        fixture
            .queue
            .enqueue(ReplicationJob {
                change: ChangeType::Update,
                virtual_storage: "default".to_string(),
                relative_path: "@repos/a".to_string(),
                source_storage: None,
                target_storage: "node-b".to_string(),
                params: None,
            })
            .await
            .unwrap();

        assert_eq!(fixture.manager.process_once("default", "node-b").await, 1);
        assert!(fixture.replicator.replicated.lock().unwrap().is_empty());
    }
}
