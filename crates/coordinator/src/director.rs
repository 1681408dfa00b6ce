use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use datastore::{ChangeType, ReplicationJob, ReplicationQueue, RepositoryStore};
use protocol::{MethodInfo, Operation, Registry, Scope};
use proxy::{Destination, RequestFinalizer, RpcOutcome, StreamParameters};
use router::Router;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::Status;
use transactions::{Threshold, TransactionManager};

use crate::status::{datastore_status, router_status};

/// Metadata key a client may set to pin repository accessors to the primary.
pub const ROUTE_ACCESSOR_POLICY_KEY: &str = "palisade-route-accessor-policy";
pub const PRIMARY_ONLY_POLICY: &str = "primary-only";

pub type Directed = StreamParameters;

/// Builds the fan-out parameters of every proxied RPC and the finalizer
/// which records its side effects.
pub struct StreamDirector {
    registry: Arc<Registry>,
    router: Arc<Router>,
    store: Arc<dyn RepositoryStore>,
    queue: Arc<dyn ReplicationQueue>,
    transactions: TransactionManager,
    /// Advertised to storage nodes for vote callbacks.
    server_addr: String,
}

enum MutatorKind {
    Update,
    Creation { replication_factor: usize },
    Delete,
    Rename { new_path: String },
    Maintenance { change: ChangeType },
}

impl StreamDirector {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<Router>,
        store: Arc<dyn RepositoryStore>,
        queue: Arc<dyn ReplicationQueue>,
        transactions: TransactionManager,
        server_addr: String,
    ) -> Self {
        Self {
            registry,
            router,
            store,
            queue,
            transactions,
            server_addr,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Directs one call. `first_frame` is the already-peeked first client
    /// message; the returned parameters carry its destination-specific
    /// rewrites.
    pub async fn direct(
        &self,
        method: &str,
        first_frame: Bytes,
        client_metadata: &MetadataMap,
    ) -> Result<Directed, Status> {
        let info = self
            .registry
            .lookup(method)
            .ok_or_else(|| Status::unimplemented(format!("unknown method {method:?}")))?;
        if info.is_intercepted() {
            return Err(Status::internal(format!(
                "intercepted method {method:?} reached the stream director"
            )));
        }

        match info.scope {
            Scope::Storage => self.direct_storage(info, first_frame, client_metadata),
            Scope::Repository => {
                self.direct_repository(info, first_frame, client_metadata)
                    .await
            }
            Scope::ServerIntercepted => unreachable!("handled above"),
        }
    }

    fn direct_storage(
        &self,
        info: &MethodInfo,
        first_frame: Bytes,
        client_metadata: &MetadataMap,
    ) -> Result<Directed, Status> {
        let field_path = info
            .storage_field
            .ok_or_else(|| Status::internal("storage-scoped method without a storage field"))?;
        let virtual_storage = protocol::peek_string(&first_frame, field_path)
            .map_err(|err| Status::invalid_argument(format!("invalid request frame: {err}")))?;
        if virtual_storage.is_empty() {
            return Err(Status::invalid_argument("storage name is not set"));
        }

        // Accessors only: storage-scoped mutators route through the legacy
        // elector and are directed by the caller holding it.
        let node = self
            .router
            .route_storage_accessor(&virtual_storage)
            .map_err(router_status)?;

        Ok(StreamParameters {
            method: info.full_method.to_string(),
            primary: Destination {
                first_frame: rewrite(&first_frame, &[field_path.to_vec()], &node.storage)?,
                storage: node.storage,
                channel: node.channel,
                metadata: client_metadata.clone(),
                on_error: None,
            },
            secondaries: Vec::new(),
            finalizer: None,
        })
    }

    async fn direct_repository(
        &self,
        info: &MethodInfo,
        first_frame: Bytes,
        client_metadata: &MetadataMap,
    ) -> Result<Directed, Status> {
        let target_path = info
            .target_repo
            .ok_or_else(|| Status::internal("repository-scoped method without a target path"))?;
        let repository = protocol::peek_repository(&first_frame, target_path)
            .map_err(|err| Status::invalid_argument(format!("invalid request frame: {err}")))?;

        let virtual_storage = repository.storage_name;
        let relative_path = repository.relative_path;
        if virtual_storage.is_empty() || relative_path.is_empty() {
            return Err(Status::invalid_argument("repository is not set"));
        }
        if !self.router.known_virtual_storage(&virtual_storage) {
            return Err(Status::invalid_argument(format!(
                "unknown virtual storage {virtual_storage:?}"
            )));
        }

        let rewrite_path = info
            .storage_rewrite_path()
            .ok_or_else(|| Status::internal("repository-scoped method without a rewrite path"))?;

        // Two-repository calls (e.g. forks) carry a second reference which
        // the routed node reads locally: it must address the same virtual
        // storage, and its storage name is rewritten alongside the target's.
        let mut rewrite_paths = vec![rewrite_path];
        if let Some(additional_path) = info.additional_repo {
            let additional = protocol::peek_repository(&first_frame, additional_path)
                .map_err(|err| {
                    Status::invalid_argument(format!("invalid request frame: {err}"))
                })?;
            if additional.storage_name.is_empty() || additional.relative_path.is_empty() {
                return Err(Status::invalid_argument("additional repository is not set"));
            }
            if additional.storage_name != virtual_storage {
                return Err(Status::invalid_argument(format!(
                    "additional repository is in virtual storage {:?}, expected {:?}",
                    additional.storage_name, virtual_storage
                )));
            }
            rewrite_paths.push(
                info.additional_rewrite_path()
                    .ok_or_else(|| Status::internal("additional repository without a rewrite path"))?,
            );
        }

        match info.operation {
            Operation::Accessor => {
                let force_primary = client_metadata
                    .get(ROUTE_ACCESSOR_POLICY_KEY)
                    .and_then(|value| value.to_str().ok())
                    == Some(PRIMARY_ONLY_POLICY);

                let node = self
                    .router
                    .route_repository_accessor(&virtual_storage, &relative_path, force_primary)
                    .await
                    .map_err(router_status)?;

                Ok(StreamParameters {
                    method: info.full_method.to_string(),
                    primary: Destination {
                        first_frame: rewrite(&first_frame, &rewrite_paths, &node.storage)?,
                        storage: node.storage,
                        channel: node.channel,
                        metadata: client_metadata.clone(),
                        on_error: None,
                    },
                    secondaries: Vec::new(),
                    finalizer: None,
                })
            }
            Operation::Mutator => {
                let kind = match info.full_method {
                    "/vault.RepositoryService/CreateRepository"
                    | "/vault.RepositoryService/CreateFork" => None,
                    "/vault.RepositoryService/RemoveRepository" => Some(MutatorKind::Delete),
                    "/vault.RepositoryService/RenameRepository" => {
                        let new_path =
                            protocol::peek_string(&first_frame, &[2]).map_err(|err| {
                                Status::invalid_argument(format!("invalid rename frame: {err}"))
                            })?;
                        Some(MutatorKind::Rename { new_path })
                    }
                    _ => Some(MutatorKind::Update),
                };

                match kind {
                    None => {
                        self.direct_creation(
                            info,
                            virtual_storage,
                            relative_path,
                            first_frame,
                            rewrite_paths,
                            client_metadata,
                        )
                        .await
                    }
                    Some(kind) => {
                        self.direct_mutator(
                            info,
                            virtual_storage,
                            relative_path,
                            first_frame,
                            rewrite_paths,
                            client_metadata,
                            kind,
                            Threshold::Strict,
                        )
                        .await
                    }
                }
            }
            Operation::Maintenance => {
                let change = maintenance_change(info.full_method)?;
                self.direct_mutator(
                    info,
                    virtual_storage,
                    relative_path,
                    first_frame,
                    rewrite_paths,
                    client_metadata,
                    MutatorKind::Maintenance { change },
                    Threshold::Majority,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn direct_mutator(
        &self,
        info: &MethodInfo,
        virtual_storage: String,
        relative_path: String,
        first_frame: Bytes,
        rewrite_paths: Vec<Vec<u32>>,
        client_metadata: &MetadataMap,
        kind: MutatorKind,
        threshold: Threshold,
    ) -> Result<Directed, Status> {
        let route = self
            .router
            .route_repository_mutator(&virtual_storage, &relative_path)
            .await
            .map_err(router_status)?;

        let mut voters = vec![route.primary.storage.clone()];
        voters.extend(route.secondaries.iter().map(|node| node.storage.clone()));
        let transaction = self.transactions.register(voters, threshold);

        let failed = Arc::new(Mutex::new(BTreeSet::new()));
        let primary = self.destination(
            &route.primary,
            &first_frame,
            &rewrite_paths,
            client_metadata,
            transaction.id(),
            None,
        )?;
        let secondaries = route
            .secondaries
            .iter()
            .map(|node| {
                self.destination(
                    node,
                    &first_frame,
                    &rewrite_paths,
                    client_metadata,
                    transaction.id(),
                    Some(failed.clone()),
                )
            })
            .collect::<Result<Vec<_>, Status>>()?;

        let finalizer = Finalizer {
            store: self.store.clone(),
            queue: self.queue.clone(),
            transactions: self.transactions.clone(),
            transaction_id: transaction.id(),
            virtual_storage,
            relative_path,
            primary: route.primary.storage.clone(),
            secondaries: route.secondaries.iter().map(|n| n.storage.clone()).collect(),
            replication_targets: route.replication_targets,
            failed,
            kind,
        };

        Ok(StreamParameters {
            method: info.full_method.to_string(),
            primary,
            secondaries,
            finalizer: Some(finalizer.boxed()),
        })
    }

    async fn direct_creation(
        &self,
        info: &MethodInfo,
        virtual_storage: String,
        relative_path: String,
        first_frame: Bytes,
        rewrite_paths: Vec<Vec<u32>>,
        client_metadata: &MetadataMap,
    ) -> Result<Directed, Status> {
        // Creating a repository which already exists is a race lost.
        if self
            .store
            .repository_exists(&virtual_storage, &relative_path)
            .await
            .map_err(datastore_status)?
        {
            return Err(Status::already_exists(format!(
                "repository {virtual_storage:?}/{relative_path:?} already exists"
            )));
        }

        let route = self
            .router
            .route_repository_creation(&virtual_storage)
            .map_err(router_status)?;

        let mut voters = vec![route.primary.storage.clone()];
        voters.extend(route.secondaries.iter().map(|node| node.storage.clone()));
        let transaction = self.transactions.register(voters, Threshold::Strict);

        let failed = Arc::new(Mutex::new(BTreeSet::new()));
        let primary = self.destination(
            &route.primary,
            &first_frame,
            &rewrite_paths,
            client_metadata,
            transaction.id(),
            None,
        )?;
        let secondaries = route
            .secondaries
            .iter()
            .map(|node| {
                self.destination(
                    node,
                    &first_frame,
                    &rewrite_paths,
                    client_metadata,
                    transaction.id(),
                    Some(failed.clone()),
                )
            })
            .collect::<Result<Vec<_>, Status>>()?;

        let finalizer = Finalizer {
            store: self.store.clone(),
            queue: self.queue.clone(),
            transactions: self.transactions.clone(),
            transaction_id: transaction.id(),
            virtual_storage,
            relative_path,
            primary: route.primary.storage.clone(),
            secondaries: route.secondaries.iter().map(|n| n.storage.clone()).collect(),
            replication_targets: route.replication_targets,
            failed,
            kind: MutatorKind::Creation {
                replication_factor: route.replication_factor,
            },
        };

        Ok(StreamParameters {
            method: info.full_method.to_string(),
            primary,
            secondaries,
            finalizer: Some(finalizer.boxed()),
        })
    }

    fn destination(
        &self,
        node: &nodes::Node,
        first_frame: &Bytes,
        rewrite_paths: &[Vec<u32>],
        client_metadata: &MetadataMap,
        transaction_id: u64,
        failed: Option<Arc<Mutex<BTreeSet<String>>>>,
    ) -> Result<Destination, Status> {
        let mut metadata = client_metadata.clone();
        inject_vote_metadata(&mut metadata, transaction_id, &node.storage, &self.server_addr);

        let storage = node.storage.clone();
        let on_error = failed.map(|failed| {
            let storage = storage.clone();
            Box::new(move |status: Status| {
                tracing::warn!(%storage, %status, "secondary failed during proxied call");
                failed.lock().unwrap().insert(storage);
            }) as Box<dyn FnOnce(Status) + Send>
        });

        Ok(Destination {
            first_frame: rewrite(first_frame, rewrite_paths, &node.storage)?,
            storage,
            channel: node.channel.clone(),
            metadata,
            on_error,
        })
    }
}

fn rewrite(frame: &Bytes, paths: &[Vec<u32>], storage: &str) -> Result<Bytes, Status> {
    let mut rewritten = frame.clone();
    for path in paths {
        rewritten = protocol::rewrite_string(&rewritten, path, storage)
            .map(Bytes::from)
            .map_err(|err| Status::invalid_argument(format!("invalid request frame: {err}")))?;
    }
    Ok(rewritten)
}

fn inject_vote_metadata(
    metadata: &mut MetadataMap,
    transaction_id: u64,
    node_name: &str,
    server_addr: &str,
) {
    metadata.insert(
        transactions::METADATA_TRANSACTION_ID,
        AsciiMetadataValue::try_from(transaction_id.to_string())
            .expect("decimal ids are valid metadata"),
    );
    match AsciiMetadataValue::try_from(node_name) {
        Ok(value) => {
            metadata.insert(transactions::METADATA_NODE_NAME, value);
        }
        Err(_) => tracing::warn!(node_name, "storage name is not valid metadata"),
    }
    match AsciiMetadataValue::try_from(server_addr) {
        Ok(value) => {
            metadata.insert(transactions::METADATA_SERVER_ADDR, value);
        }
        Err(_) => tracing::warn!(server_addr, "server address is not valid metadata"),
    }
}

fn maintenance_change(method: &str) -> Result<ChangeType, Status> {
    Ok(match method {
        "/vault.RepositoryService/GarbageCollect" => ChangeType::Gc,
        "/vault.RepositoryService/RepackFull" => ChangeType::RepackFull,
        "/vault.RepositoryService/RepackIncremental" => ChangeType::RepackIncremental,
        "/vault.RepositoryService/Cleanup" => ChangeType::Cleanup,
        "/vault.RepositoryService/PackRefs" => ChangeType::PackRefs,
        "/vault.RepositoryService/WriteCommitGraph" => ChangeType::WriteCommitGraph,
        "/vault.RepositoryService/MidxRepack" => ChangeType::MidxRepack,
        "/vault.RepositoryService/OptimizeRepository" => ChangeType::Optimize,
        _ => {
            return Err(Status::internal(format!(
                "maintenance method {method:?} has no replication change"
            )))
        }
    })
}

/// Exactly-once post-RPC bookkeeping: generation bumps and asynchronous
/// repair jobs. Store and queue failures on the non-creation paths are
/// logged and left to the reconciler; the repositories converge through the
/// replication queue.
struct Finalizer {
    store: Arc<dyn RepositoryStore>,
    queue: Arc<dyn ReplicationQueue>,
    transactions: TransactionManager,
    transaction_id: u64,
    virtual_storage: String,
    relative_path: String,
    primary: String,
    secondaries: Vec<String>,
    replication_targets: Vec<String>,
    failed: Arc<Mutex<BTreeSet<String>>>,
    kind: MutatorKind,
}

impl Finalizer {
    fn boxed(self) -> RequestFinalizer {
        Box::new(move |outcome| Box::pin(self.run(outcome)))
    }

    async fn run(self, outcome: RpcOutcome) -> Result<(), Status> {
        let transaction = self.transactions.finish(self.transaction_id);

        if !outcome.primary_ok {
            // The primary's failure is the client's result; no bookkeeping
            // and no repair jobs.
            return Ok(());
        }

        let committed: BTreeSet<String> = transaction
            .map(|transaction| transaction.committed_storages().into_iter().collect())
            .unwrap_or_default();
        let failed = self.failed.lock().unwrap().clone();

        // Secondaries which both finished their stream and reached quorum
        // on every vote are carried along; the rest get repair jobs.
        let (updated, outdated): (Vec<String>, Vec<String>) = self
            .secondaries
            .iter()
            .cloned()
            .partition(|storage| committed.contains(storage) && !failed.contains(storage));
        let mut outdated = outdated;
        outdated.extend(self.replication_targets.iter().cloned());

        match &self.kind {
            MutatorKind::Update => {
                if let Err(err) = self
                    .store
                    .increment_generation(
                        &self.virtual_storage,
                        &self.relative_path,
                        &self.primary,
                        &updated,
                    )
                    .await
                {
                    tracing::error!(
                        virtual_storage = %self.virtual_storage,
                        relative_path = %self.relative_path,
                        ?err,
                        "failed to increment repository generation"
                    );
                }
                self.enqueue_all(ChangeType::Update, &outdated, Some(&self.primary), None)
                    .await;
                Ok(())
            }
            MutatorKind::Creation { replication_factor } => {
                // Creation bookkeeping runs before the response is sent; a
                // failure here must fail the RPC.
                self.store
                    .create_repository(
                        &self.virtual_storage,
                        &self.relative_path,
                        &self.primary,
                        &updated,
                        &outdated,
                        true,
                        *replication_factor > 0,
                    )
                    .await
                    .map_err(datastore_status)?;
                self.enqueue_all(ChangeType::Update, &outdated, Some(&self.primary), None)
                    .await;
                Ok(())
            }
            MutatorKind::Delete => {
                let mut reached = vec![self.primary.clone()];
                reached.extend(updated);
                if let Err(err) = self
                    .store
                    .delete_repository(&self.virtual_storage, &self.relative_path, &reached)
                    .await
                {
                    tracing::error!(?err, "failed to delete repository record");
                }
                self.enqueue_all(ChangeType::Delete, &outdated, None, None).await;
                Ok(())
            }
            MutatorKind::Rename { new_path } => {
                if let Err(err) = self
                    .store
                    .rename_repository(&self.virtual_storage, &self.relative_path, new_path)
                    .await
                {
                    tracing::error!(?err, "failed to rename repository record");
                }
                self.enqueue_all(
                    ChangeType::Rename,
                    &outdated,
                    None,
                    Some(serde_json::json!({ "relative_path": new_path })),
                )
                .await;
                Ok(())
            }
            MutatorKind::Maintenance { change } => {
                self.enqueue_all(*change, &outdated, None, None).await;
                Ok(())
            }
        }
    }

    async fn enqueue_all(
        &self,
        change: ChangeType,
        targets: &[String],
        source: Option<&str>,
        params: Option<serde_json::Value>,
    ) {
        for target in targets {
            let job = ReplicationJob {
                change,
                virtual_storage: self.virtual_storage.clone(),
                relative_path: self.relative_path.clone(),
                source_storage: source.map(str::to_string),
                target_storage: target.clone(),
                params: params.clone(),
            };
            if let Err(err) = self.queue.enqueue(job).await {
                tracing::error!(%target, ?err, "failed to enqueue replication job");
            }
        }
    }
}
