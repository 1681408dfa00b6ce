//! Message types and thin client stubs for the wire protocols spoken by the
//! proxy: the standard gRPC health protocol, the `vault` storage-node
//! protocol, and the `palisade` services served by the proxy itself.
//!
//! Stubs are hand-maintained over `tonic::client::Grpc` rather than emitted
//! by `tonic-build`: the surface is small and the proxy additionally drives
//! these methods as opaque byte streams, for which no generated code exists.

pub mod health;
pub mod palisade;
pub mod vault;
