//! The proxy's knowledge of the RPC surface it fronts: a static registry
//! mapping every routable method to its scope, operation type and repository
//! field path, plus wire-format helpers which peek into and rewrite opaque
//! request frames along those paths without a schema.

mod peek;
mod registry;

pub use peek::{peek_repository, peek_string, rewrite_string};
pub use registry::{MethodInfo, Operation, Registry, Scope};

/// Field number of `storage_name` within `vault.Repository`.
pub const REPOSITORY_STORAGE_FIELD: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("request frame is truncated or malformed at byte {0}")]
    Malformed(usize),
    #[error("field {field} is missing from the request frame")]
    MissingField { field: u32 },
    #[error("field {field} has wire type {wire_type}, expected length-delimited")]
    UnexpectedWireType { field: u32, wire_type: u8 },
    #[error("failed to decode repository message: {0}")]
    Decode(#[from] prost::DecodeError),
}
