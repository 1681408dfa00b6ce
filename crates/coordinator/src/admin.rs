//! Handlers for the administrative RPCs the proxy intercepts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use datastore::{RepositoryInfo, RepositoryStore};
use nodes::HealthChecker;
use proto::palisade::*;
use tonic::Status;

use crate::status::datastore_status;

pub struct AdminHandlers {
    store: Arc<dyn RepositoryStore>,
    health: Arc<dyn HealthChecker>,
    configured: HashMap<String, Vec<String>>,
}

impl AdminHandlers {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        health: Arc<dyn HealthChecker>,
        configured: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            store,
            health,
            configured,
        }
    }

    fn storages(&self, virtual_storage: &str) -> Result<&Vec<String>, Status> {
        if virtual_storage.is_empty() {
            return Err(Status::invalid_argument("virtual storage is not set"));
        }
        self.configured.get(virtual_storage).ok_or_else(|| {
            Status::invalid_argument(format!("unknown virtual storage {virtual_storage:?}"))
        })
    }

    pub async fn repository_metadata(
        &self,
        request: GetRepositoryMetadataRequest,
    ) -> Result<GetRepositoryMetadataResponse, Status> {
        self.storages(&request.virtual_storage)?;
        let info = self
            .store
            .repository_metadata(&request.virtual_storage, &request.relative_path)
            .await
            .map_err(datastore_status)?;

        let healthy = self.health.healthy_storages(&request.virtual_storage);
        Ok(GetRepositoryMetadataResponse {
            metadata: Some(to_metadata(info, &healthy)),
        })
    }

    pub async fn dataloss_check(
        &self,
        request: DatalossCheckRequest,
    ) -> Result<DatalossCheckResponse, Status> {
        self.storages(&request.virtual_storage)?;
        let healthy = self.health.healthy_storages(&request.virtual_storage);

        let repositories = self
            .store
            .get_partially_available_repositories(&request.virtual_storage)
            .await
            .map_err(datastore_status)?
            .into_iter()
            .filter(|info| request.include_partially_replicated || primary_outdated(info))
            .map(|info| to_metadata(info, &healthy))
            .collect();

        Ok(DatalossCheckResponse { repositories })
    }

    pub async fn set_authoritative_storage(
        &self,
        request: SetAuthoritativeStorageRequest,
    ) -> Result<SetAuthoritativeStorageResponse, Status> {
        let storages = self.storages(&request.virtual_storage)?;
        if !storages.contains(&request.authoritative_storage) {
            return Err(Status::invalid_argument(format!(
                "unknown authoritative storage {:?}",
                request.authoritative_storage
            )));
        }

        self.store
            .set_authoritative_replica(
                &request.virtual_storage,
                &request.relative_path,
                &request.authoritative_storage,
            )
            .await
            .map_err(datastore_status)?;
        Ok(SetAuthoritativeStorageResponse {})
    }

    pub async fn set_replication_factor(
        &self,
        request: SetReplicationFactorRequest,
    ) -> Result<SetReplicationFactorResponse, Status> {
        let storages = self.storages(&request.virtual_storage)?;
        let factor = usize::try_from(request.replication_factor).unwrap_or(0);
        if factor < 1 || factor > storages.len() {
            return Err(Status::invalid_argument(format!(
                "replication factor must be between 1 and {}, got {}",
                storages.len(),
                request.replication_factor
            )));
        }

        let storages = self
            .store
            .set_replication_factor(&request.virtual_storage, &request.relative_path, factor)
            .await
            .map_err(datastore_status)?;
        Ok(SetReplicationFactorResponse { storages })
    }

    pub async fn repository_replicas(
        &self,
        request: GetRepositoryReplicasRequest,
    ) -> Result<GetRepositoryReplicasResponse, Status> {
        self.storages(&request.virtual_storage)?;
        let info = self
            .store
            .repository_metadata(&request.virtual_storage, &request.relative_path)
            .await
            .map_err(datastore_status)?;
        let healthy = self.health.healthy_storages(&request.virtual_storage);

        Ok(GetRepositoryReplicasResponse {
            replicas: to_metadata(info, &healthy).replicas,
        })
    }
}

/// True dataloss: the write path is lost because the primary (if any) is
/// missing the latest generation.
fn primary_outdated(info: &RepositoryInfo) -> bool {
    let Some(primary) = &info.primary else {
        return true;
    };
    info.replicas
        .iter()
        .find(|replica| &replica.storage == primary)
        .map(|replica| replica.generation < info.generation)
        .unwrap_or(true)
}

fn to_metadata(info: RepositoryInfo, healthy: &BTreeSet<String>) -> RepositoryMetadata {
    RepositoryMetadata {
        virtual_storage: info.virtual_storage,
        relative_path: info.relative_path,
        primary: info.primary.unwrap_or_default(),
        generation: info.generation,
        replicas: info
            .replicas
            .into_iter()
            .map(|replica| ReplicaMetadata {
                healthy: healthy.contains(&replica.storage),
                assigned: replica.assigned,
                generation: replica.generation,
                storage: replica.storage,
            })
            .collect(),
    }
}
