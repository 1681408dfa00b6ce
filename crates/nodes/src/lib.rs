//! The pool of connections to every configured storage node, and the health
//! manager which probes them and derives the fleet-wide healthy set.

mod health;
mod set;

pub use health::{HealthChecker, HealthManager, HealthOptions, HealthSnapshot};
pub use set::{dial_channel, Node, NodeConfig, NodeSet};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid storage node endpoint {address:?}")]
    InvalidEndpoint {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("duplicate storage {storage:?} in virtual storage {virtual_storage:?}")]
    DuplicateStorage {
        virtual_storage: String,
        storage: String,
    },
    #[error("unknown storage {storage:?} in virtual storage {virtual_storage:?}")]
    UnknownStorage {
        virtual_storage: String,
        storage: String,
    },
}
