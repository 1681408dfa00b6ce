use datastore::ChangeType;
use nodes::Node;
use proto::vault;

use crate::ReplicationError;

/// The storage-node operations replication jobs dispatch to. Behind a trait
/// so the manager and reconciler are testable without live nodes.
#[async_trait::async_trait]
pub trait Replicator: Send + Sync {
    /// Creates or updates the repository on `target` by fetching from
    /// `source`.
    async fn replicate(
        &self,
        target: &Node,
        relative_path: &str,
        source: &Node,
    ) -> Result<(), ReplicationError>;

    async fn destroy(&self, target: &Node, relative_path: &str) -> Result<(), ReplicationError>;

    async fn rename(
        &self,
        target: &Node,
        relative_path: &str,
        new_relative_path: &str,
    ) -> Result<(), ReplicationError>;

    /// Housekeeping changes which touch repository internals only.
    async fn maintain(
        &self,
        change: ChangeType,
        target: &Node,
        relative_path: &str,
    ) -> Result<(), ReplicationError>;

    async fn repository_exists(
        &self,
        node: &Node,
        relative_path: &str,
    ) -> Result<bool, ReplicationError>;
}

fn repository(node: &Node, relative_path: &str) -> Option<vault::Repository> {
    Some(vault::Repository {
        storage_name: node.storage.clone(),
        relative_path: relative_path.to_string(),
    })
}

/// The production replicator, speaking `vault.RepositoryService` over each
/// node's channel.
#[derive(Default)]
pub struct GrpcReplicator;

impl GrpcReplicator {
    pub fn new() -> Self {
        Self
    }

    fn client(node: &Node) -> vault::RepositoryServiceClient<tonic::transport::Channel> {
        vault::RepositoryServiceClient::new(node.channel.clone())
    }
}

#[async_trait::async_trait]
impl Replicator for GrpcReplicator {
    async fn replicate(
        &self,
        target: &Node,
        relative_path: &str,
        source: &Node,
    ) -> Result<(), ReplicationError> {
        Self::client(target)
            .replicate_repository(vault::ReplicateRepositoryRequest {
                repository: repository(target, relative_path),
                source: repository(source, relative_path),
            })
            .await?;
        Ok(())
    }

    async fn destroy(&self, target: &Node, relative_path: &str) -> Result<(), ReplicationError> {
        Self::client(target)
            .remove_repository(vault::RemoveRepositoryRequest {
                repository: repository(target, relative_path),
            })
            .await?;
        Ok(())
    }

    async fn rename(
        &self,
        target: &Node,
        relative_path: &str,
        new_relative_path: &str,
    ) -> Result<(), ReplicationError> {
        Self::client(target)
            .rename_repository(vault::RenameRepositoryRequest {
                repository: repository(target, relative_path),
                new_relative_path: new_relative_path.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn maintain(
        &self,
        change: ChangeType,
        target: &Node,
        relative_path: &str,
    ) -> Result<(), ReplicationError> {
        let mut client = Self::client(target);
        let repository = repository(target, relative_path);

        match change {
            ChangeType::Gc => {
                client
                    .garbage_collect(vault::GarbageCollectRequest {
                        repository,
                        prune: true,
                    })
                    .await?;
            }
            ChangeType::RepackFull => {
                client
                    .repack_full(vault::RepackFullRequest {
                        repository,
                        create_bitmap: true,
                    })
                    .await?;
            }
            ChangeType::RepackIncremental => {
                client
                    .repack_incremental(vault::RepackIncrementalRequest { repository })
                    .await?;
            }
            ChangeType::Cleanup => {
                client.cleanup(vault::CleanupRequest { repository }).await?;
            }
            ChangeType::PackRefs => {
                client.pack_refs(vault::PackRefsRequest { repository }).await?;
            }
            ChangeType::WriteCommitGraph => {
                client
                    .write_commit_graph(vault::WriteCommitGraphRequest { repository })
                    .await?;
            }
            ChangeType::MidxRepack => {
                client
                    .midx_repack(vault::MidxRepackRequest { repository })
                    .await?;
            }
            ChangeType::Optimize => {
                client
                    .optimize_repository(vault::OptimizeRepositoryRequest { repository })
                    .await?;
            }
            other => {
                return Err(ReplicationError::MalformedJob(format!(
                    "{} is not a maintenance change",
                    other.as_str()
                )))
            }
        }
        Ok(())
    }

    async fn repository_exists(
        &self,
        node: &Node,
        relative_path: &str,
    ) -> Result<bool, ReplicationError> {
        let response = Self::client(node)
            .repository_exists(vault::RepositoryExistsRequest {
                repository: repository(node, relative_path),
            })
            .await?;
        Ok(response.into_inner().exists)
    }
}
