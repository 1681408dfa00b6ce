//! Stream director behavior against in-memory stores: routing decisions,
//! per-destination frame rewrites, vote metadata, and finalizer side
//! effects.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use coordinator::StreamDirector;
use datastore::{
    ChangeType, JobState, MemoryQueue, MemoryRepositoryStore, ReplicationQueue, RepositoryStore,
};
use election::PerRepositoryElector;
use nodes::{HealthChecker, NodeConfig, NodeSet};
use prost::Message;
use protocol::Registry;
use proto::vault::{
    RenameRepositoryRequest, ReplicateRepositoryRequest, Repository, RepositoryExistsRequest,
};
use proxy::RpcOutcome;
use router::Router;
use tonic::Code;
use transactions::TransactionManager;

struct FakeHealth(Mutex<BTreeSet<String>>);

impl FakeHealth {
    fn new(storages: &[&str]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(
            storages.iter().map(|s| s.to_string()).collect(),
        )))
    }
}

impl HealthChecker for FakeHealth {
    fn healthy_storages(&self, _virtual_storage: &str) -> BTreeSet<String> {
        self.0.lock().unwrap().clone()
    }
}

struct Fixture {
    director: StreamDirector,
    store: Arc<MemoryRepositoryStore>,
    queue: Arc<MemoryQueue>,
    transactions: TransactionManager,
}

fn fixture(healthy: &[&str]) -> Fixture {
    let configured = HashMap::from([(
        "default".to_string(),
        strings(&["node-a", "node-b", "node-c"]),
    )]);
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
    let store = Arc::new(MemoryRepositoryStore::new(configured));
    let queue = Arc::new(MemoryQueue::new());
    let health = FakeHealth::new(healthy);
    let elector = Arc::new(PerRepositoryElector::new(
        store.clone(),
        health.clone(),
        Duration::from_secs(10),
    ));
    let router = Arc::new(Router::new(
        nodes,
        store.clone(),
        health,
        elector,
        3,
    ));
    let transactions = TransactionManager::new();

    Fixture {
        director: StreamDirector::new(
            Arc::new(Registry::new()),
            router,
            store.clone(),
            queue.clone(),
            transactions.clone(),
            "tcp://proxy.internal:2305".to_string(),
        ),
        store,
        queue,
        transactions,
    }
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn repo_frame(virtual_storage: &str, relative_path: &str) -> Bytes {
    RepositoryExistsRequest {
        repository: Some(Repository {
            storage_name: virtual_storage.to_string(),
            relative_path: relative_path.to_string(),
        }),
    }
    .encode_to_vec()
    .into()
}

fn transaction_id(metadata: &tonic::metadata::MetadataMap) -> u64 {
    metadata
        .get(transactions::METADATA_TRANSACTION_ID)
        .expect("vote metadata is injected")
        .to_str()
        .unwrap()
        .parse()
        .unwrap()
}

async fn vote_all(transactions: &TransactionManager, id: u64, storages: &[String]) {
    futures::future::join_all(storages.iter().map(|storage| {
        let transactions = transactions.clone();
        async move {
            transactions
                .vote(id, storage, b"agreed".to_vec())
                .await
                .unwrap()
        }
    }))
    .await;
}

#[tokio::test]
async fn unknown_methods_are_unimplemented() {
    let fixture = fixture(&["node-a", "node-b", "node-c"]);
    let err = fixture
        .director
        .direct(
            "/vault.RepositoryService/Bogus",
            repo_frame("default", "@repos/a"),
            &Default::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn unknown_virtual_storage_is_rejected() {
    let fixture = fixture(&["node-a", "node-b", "node-c"]);
    let err = fixture
        .director
        .direct(
            "/vault.RepositoryService/RepositoryExists",
            repo_frame("missing", "@repos/a"),
            &Default::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn accessors_route_to_one_rewritten_destination() {
    let fixture = fixture(&["node-a", "node-b", "node-c"]);
    fixture
        .store
        .create_repository("default", "@repos/a", "node-a", &strings(&["node-b"]), &[], true, true)
        .await
        .unwrap();

    let params = fixture
        .director
        .direct(
            "/vault.RepositoryService/RepositoryExists",
            repo_frame("default", "@repos/a"),
            &Default::default(),
        )
        .await
        .unwrap();

    assert!(params.secondaries.is_empty());
    assert!(params.finalizer.is_none());
    assert!(["node-a", "node-b"].contains(&params.primary.storage.as_str()));

    // The first frame now addresses the physical storage.
    let rewritten = protocol::peek_repository(&params.primary.first_frame, &[1]).unwrap();
    assert_eq!(rewritten.storage_name, params.primary.storage);
    assert_eq!(rewritten.relative_path, "@repos/a");

    // Accessors carry no vote metadata.
    assert!(params
        .primary
        .metadata
        .get(transactions::METADATA_TRANSACTION_ID)
        .is_none());
}

#[tokio::test]
async fn mutator_bumps_generations_for_committed_voters() {
    let fixture = fixture(&["node-a", "node-b", "node-c"]);
    fixture
        .store
        .create_repository(
            "default",
            "@repos/a",
            "node-a",
            &strings(&["node-b"]),
            &strings(&["node-c"]),
            true,
            true,
        )
        .await
        .unwrap();

    let mut params = fixture
        .director
        .direct(
            "/vault.ObjectService/WriteObjects",
            repo_frame("default", "@repos/a"),
            &Default::default(),
        )
        .await
        .unwrap();

    assert_eq!(params.primary.storage, "node-a");
    assert_eq!(
        params.secondaries.iter().map(|d| d.storage.as_str()).collect::<Vec<_>>(),
        vec!["node-b"]
    );

    // Each destination sees itself in the rewritten frame, and all share
    // one transaction id.
    let id = transaction_id(&params.primary.metadata);
    for destination in std::iter::once(&params.primary).chain(&params.secondaries) {
        assert_eq!(transaction_id(&destination.metadata), id);
        let rewritten = protocol::peek_repository(&destination.first_frame, &[1]).unwrap();
        assert_eq!(rewritten.storage_name, destination.storage);
    }

    vote_all(&fixture.transactions, id, &strings(&["node-a", "node-b"])).await;
    let finalizer = params.finalizer.take().unwrap();
    finalizer(RpcOutcome { primary_ok: true }).await.unwrap();

    // Voters advanced; the inconsistent replica gets an async repair.
    assert_eq!(fixture.store.get_generation("default", "@repos/a", "node-a").await.unwrap(), 1);
    assert_eq!(fixture.store.get_generation("default", "@repos/a", "node-b").await.unwrap(), 1);

    let jobs = fixture.queue.dequeue("default", "node-c", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.change, ChangeType::Update);
    assert_eq!(jobs[0].job.source_storage.as_deref(), Some("node-a"));
}

#[tokio::test]
async fn failed_primary_produces_no_side_effects() {
    let fixture = fixture(&["node-a", "node-b", "node-c"]);
    fixture
        .store
        .create_repository("default", "@repos/a", "node-a", &strings(&["node-b", "node-c"]), &[], true, true)
        .await
        .unwrap();

    let mut params = fixture
        .director
        .direct(
            "/vault.ObjectService/WriteObjects",
            repo_frame("default", "@repos/a"),
            &Default::default(),
        )
        .await
        .unwrap();

    let finalizer = params.finalizer.take().unwrap();
    finalizer(RpcOutcome { primary_ok: false }).await.unwrap();

    assert_eq!(fixture.store.get_generation("default", "@repos/a", "node-a").await.unwrap(), 0);
    for storage in ["node-a", "node-b", "node-c"] {
        assert!(fixture.queue.dequeue("default", storage, 10).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn non_voting_secondaries_become_replication_targets() {
    let fixture = fixture(&["node-a", "node-b", "node-c"]);
    fixture
        .store
        .create_repository("default", "@repos/a", "node-a", &strings(&["node-b", "node-c"]), &[], true, true)
        .await
        .unwrap();

    let mut params = fixture
        .director
        .direct(
            "/vault.ObjectService/WriteObjects",
            repo_frame("default", "@repos/a"),
            &Default::default(),
        )
        .await
        .unwrap();

    // Only the primary and node-b vote; node-c stays silent, so the strict
    // quorum cannot resolve until the RPC ends and the finalizer closes the
    // transaction.
    let id = transaction_id(&params.primary.metadata);
    let pending_votes = {
        let transactions = fixture.transactions.clone();
        tokio::spawn(async move {
            vote_all(&transactions, id, &strings(&["node-a", "node-b"])).await;
        })
    };
    tokio::task::yield_now().await;

    let finalizer = params.finalizer.take().unwrap();
    finalizer(RpcOutcome { primary_ok: true }).await.unwrap();
    pending_votes.await.unwrap();

    // No secondary reached quorum: both get repair jobs and the generation
    // bump covers the primary alone.
    for target in ["node-b", "node-c"] {
        let jobs = fixture.queue.dequeue("default", target, 10).await.unwrap();
        assert_eq!(jobs.len(), 1, "{target} should have a repair job");
    }
}

#[tokio::test]
async fn creation_routes_spread_and_record_assignments() {
    let fixture = fixture(&["node-a", "node-b"]);

    let mut params = fixture
        .director
        .direct(
            "/vault.RepositoryService/CreateRepository",
            repo_frame("default", "@repos/new"),
            &Default::default(),
        )
        .await
        .unwrap();

    let primary = params.primary.storage.clone();
    let secondaries: Vec<String> = params
        .secondaries
        .iter()
        .map(|d| d.storage.clone())
        .collect();

    let id = transaction_id(&params.primary.metadata);
    let mut voters = vec![primary.clone()];
    voters.extend(secondaries.iter().cloned());
    vote_all(&fixture.transactions, id, &voters).await;

    let finalizer = params.finalizer.take().unwrap();
    finalizer(RpcOutcome { primary_ok: true }).await.unwrap();

    assert!(fixture.store.repository_exists("default", "@repos/new").await.unwrap());
    assert_eq!(
        fixture.store.get_primary("default", "@repos/new").await.unwrap().storage,
        Some(primary.clone())
    );
    for storage in &voters {
        assert_eq!(
            fixture.store.get_generation("default", "@repos/new", storage).await.unwrap(),
            0
        );
    }

    // The unhealthy storage holds no copy yet and is queued for repair.
    let jobs = fixture.queue.dequeue("default", "node-c", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.change, ChangeType::Update);

    // A second creation of the same path is refused up front.
    let err = fixture
        .director
        .direct(
            "/vault.RepositoryService/CreateRepository",
            repo_frame("default", "@repos/new"),
            &Default::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
}

fn fork_frame(target_storage: &str, source_storage: Option<&str>) -> Bytes {
    // A fork request carries the target repository in field 1 and the
    // source in field 2, the same wire shape as a replication request.
    ReplicateRepositoryRequest {
        repository: Some(Repository {
            storage_name: target_storage.to_string(),
            relative_path: "@repos/fork".to_string(),
        }),
        source: source_storage.map(|storage| Repository {
            storage_name: storage.to_string(),
            relative_path: "@repos/origin".to_string(),
        }),
    }
    .encode_to_vec()
    .into()
}

#[tokio::test]
async fn fork_rewrites_both_repository_references() {
    let fixture = fixture(&["node-a", "node-b", "node-c"]);

    let params = fixture
        .director
        .direct(
            "/vault.RepositoryService/CreateFork",
            fork_frame("default", Some("default")),
            &Default::default(),
        )
        .await
        .unwrap();

    // Every destination reads the fork source locally: both repository
    // references must address that destination's physical storage.
    assert_eq!(params.secondaries.len(), 2);
    for destination in std::iter::once(&params.primary).chain(&params.secondaries) {
        let target = protocol::peek_repository(&destination.first_frame, &[1]).unwrap();
        assert_eq!(target.storage_name, destination.storage);
        assert_eq!(target.relative_path, "@repos/fork");

        let source = protocol::peek_repository(&destination.first_frame, &[2]).unwrap();
        assert_eq!(source.storage_name, destination.storage);
        assert_eq!(source.relative_path, "@repos/origin");
    }
}

#[tokio::test]
async fn fork_source_must_share_the_virtual_storage() {
    let fixture = fixture(&["node-a", "node-b", "node-c"]);

    let err = fixture
        .director
        .direct(
            "/vault.RepositoryService/CreateFork",
            fork_frame("default", Some("other")),
            &Default::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = fixture
        .director
        .direct(
            "/vault.RepositoryService/CreateFork",
            fork_frame("default", None),
            &Default::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn rename_moves_the_record_and_repairs_stragglers() {
    let fixture = fixture(&["node-a", "node-b"]);
    fixture
        .store
        .create_repository(
            "default",
            "@repos/old",
            "node-a",
            &strings(&["node-b"]),
            &strings(&["node-c"]),
            true,
            true,
        )
        .await
        .unwrap();

    let frame: Bytes = RenameRepositoryRequest {
        repository: Some(Repository {
            storage_name: "default".to_string(),
            relative_path: "@repos/old".to_string(),
        }),
        new_relative_path: "@repos/renamed".to_string(),
    }
    .encode_to_vec()
    .into();

    let mut params = fixture
        .director
        .direct("/vault.RepositoryService/RenameRepository", frame, &Default::default())
        .await
        .unwrap();

    let id = transaction_id(&params.primary.metadata);
    vote_all(&fixture.transactions, id, &strings(&["node-a", "node-b"])).await;
    let finalizer = params.finalizer.take().unwrap();
    finalizer(RpcOutcome { primary_ok: true }).await.unwrap();

    assert!(!fixture.store.repository_exists("default", "@repos/old").await.unwrap());
    assert!(fixture.store.repository_exists("default", "@repos/renamed").await.unwrap());

    // The straggler replica is renamed through the queue.
    let jobs = fixture.queue.dequeue("default", "node-c", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.change, ChangeType::Rename);
    assert_eq!(
        jobs[0].job.params.as_ref().unwrap()["relative_path"],
        "@repos/renamed"
    );
}

#[tokio::test]
async fn maintenance_enqueues_repairs_without_touching_generations() {
    let fixture = fixture(&["node-a", "node-b"]);
    fixture
        .store
        .create_repository(
            "default",
            "@repos/a",
            "node-a",
            &strings(&["node-b"]),
            &strings(&["node-c"]),
            true,
            true,
        )
        .await
        .unwrap();

    let mut params = fixture
        .director
        .direct(
            "/vault.RepositoryService/OptimizeRepository",
            repo_frame("default", "@repos/a"),
            &Default::default(),
        )
        .await
        .unwrap();

    let id = transaction_id(&params.primary.metadata);
    vote_all(&fixture.transactions, id, &strings(&["node-a", "node-b"])).await;
    let finalizer = params.finalizer.take().unwrap();
    finalizer(RpcOutcome { primary_ok: true }).await.unwrap();

    assert_eq!(fixture.store.get_generation("default", "@repos/a", "node-a").await.unwrap(), 0);
    let jobs = fixture.queue.dequeue("default", "node-c", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.change, ChangeType::Optimize);
    assert_eq!(jobs[0].state, JobState::InProgress);
}

#[tokio::test]
async fn delete_removes_reached_replicas_and_queues_the_rest() {
    let fixture = fixture(&["node-a", "node-b"]);
    fixture
        .store
        .create_repository(
            "default",
            "@repos/a",
            "node-a",
            &strings(&["node-b"]),
            &strings(&["node-c"]),
            true,
            true,
        )
        .await
        .unwrap();

    let mut params = fixture
        .director
        .direct(
            "/vault.RepositoryService/RemoveRepository",
            repo_frame("default", "@repos/a"),
            &Default::default(),
        )
        .await
        .unwrap();

    let id = transaction_id(&params.primary.metadata);
    vote_all(&fixture.transactions, id, &strings(&["node-a", "node-b"])).await;
    let finalizer = params.finalizer.take().unwrap();
    finalizer(RpcOutcome { primary_ok: true }).await.unwrap();

    assert!(!fixture.store.repository_exists("default", "@repos/a").await.unwrap());
    let jobs = fixture.queue.dequeue("default", "node-c", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.change, ChangeType::Delete);
}
