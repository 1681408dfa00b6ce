//! Asynchronous replication: the background workers which drain the
//! replication queue against storage nodes, the stale-event reaper, and the
//! periodic reconciler which repairs drift the write path missed.

mod manager;
mod reconciler;
mod replicator;

pub use manager::{ReplicationManager, ReplicationOptions};
pub use reconciler::{Reconciler, ReconcilerOptions, ReconcilerStats};
pub use replicator::{GrpcReplicator, Replicator};

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("replication job is malformed: {0}")]
    MalformedJob(String),
    #[error(transparent)]
    Node(#[from] nodes::NodeError),
    #[error(transparent)]
    Grpc(#[from] tonic::Status),
    #[error(transparent)]
    Datastore(#[from] datastore::DatastoreError),
}
