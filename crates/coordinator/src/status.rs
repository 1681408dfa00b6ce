//! Mapping of internal errors onto the RPC status surface.

use datastore::DatastoreError;
use election::ElectionError;
use router::RouterError;
use tonic::Status;

pub fn datastore_status(err: DatastoreError) -> Status {
    match &err {
        DatastoreError::RepositoryNotFound { .. } => Status::not_found(err.to_string()),
        DatastoreError::AlreadyExists => Status::already_exists(err.to_string()),
        DatastoreError::WriteToOutdated | DatastoreError::DowngradeAttempted { .. } => {
            Status::failed_precondition(err.to_string())
        }
        DatastoreError::NoRowsAffected => Status::not_found(err.to_string()),
        DatastoreError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        DatastoreError::AttemptsExhausted | DatastoreError::Sql(_) => {
            Status::internal(err.to_string())
        }
    }
}

pub fn election_status(err: ElectionError) -> Status {
    match err {
        ElectionError::NoCandidates { .. } | ElectionError::NoHealthyNodes(_) => {
            Status::unavailable(err.to_string())
        }
        ElectionError::Datastore(err) => datastore_status(err),
    }
}

pub fn router_status(err: RouterError) -> Status {
    match err {
        RouterError::NoHealthyNodes(_)
        | RouterError::NoSuitableNode { .. }
        | RouterError::PrimaryNotHealthy { .. } => Status::unavailable(err.to_string()),
        RouterError::RepositoryReadOnly { .. } | RouterError::VirtualStorageReadOnly(_) => {
            Status::failed_precondition(err.to_string())
        }
        RouterError::PrimaryUnassigned { .. } | RouterError::StorageMutatorsUnsupported => {
            Status::internal(err.to_string())
        }
        RouterError::Election(err) => election_status(err),
        RouterError::Datastore(err) => datastore_status(err),
        RouterError::Node(err) => Status::internal(err.to_string()),
    }
}
