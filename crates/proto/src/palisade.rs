//! Services served by the proxy itself: the reference-transaction voting
//! surface called back by storage nodes, and the administrative surface for
//! inspecting and repairing replication state.

/// Method paths, matched by the proxy's top-level dispatcher.
pub const VOTE_TRANSACTION_METHOD: &str = "/palisade.RefTransactionService/VoteTransaction";
pub const STOP_TRANSACTION_METHOD: &str = "/palisade.RefTransactionService/StopTransaction";
pub const REPOSITORY_METADATA_METHOD: &str = "/palisade.AdminService/GetRepositoryMetadata";
pub const DATALOSS_CHECK_METHOD: &str = "/palisade.AdminService/DatalossCheck";
pub const SET_AUTHORITATIVE_STORAGE_METHOD: &str =
    "/palisade.AdminService/SetAuthoritativeStorage";
pub const SET_REPLICATION_FACTOR_METHOD: &str = "/palisade.AdminService/SetReplicationFactor";
pub const REPOSITORY_REPLICAS_METHOD: &str = "/palisade.AdminService/GetRepositoryReplicas";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteTransactionRequest {
    #[prost(uint64, tag = "1")]
    pub transaction_id: u64,
    /// Name of the voting storage.
    #[prost(string, tag = "2")]
    pub node: ::prost::alloc::string::String,
    /// Fixed-length hash over the reference updates this vote stands for.
    #[prost(bytes = "vec", tag = "3")]
    pub vote_hash: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct VoteTransactionResponse {
    #[prost(enumeration = "VoteResult", tag = "1")]
    pub vote_result: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum VoteResult {
    Commit = 0,
    Abort = 1,
    Stop = 2,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StopTransactionRequest {
    #[prost(uint64, tag = "1")]
    pub transaction_id: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StopTransactionResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRepositoryMetadataRequest {
    #[prost(string, tag = "1")]
    pub virtual_storage: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub relative_path: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicaMetadata {
    #[prost(string, tag = "1")]
    pub storage: ::prost::alloc::string::String,
    /// -1 when the storage holds no copy of the repository.
    #[prost(int64, tag = "2")]
    pub generation: i64,
    #[prost(bool, tag = "3")]
    pub assigned: bool,
    #[prost(bool, tag = "4")]
    pub healthy: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RepositoryMetadata {
    #[prost(string, tag = "1")]
    pub virtual_storage: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub relative_path: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub primary: ::prost::alloc::string::String,
    #[prost(int64, tag = "4")]
    pub generation: i64,
    #[prost(message, repeated, tag = "5")]
    pub replicas: ::prost::alloc::vec::Vec<ReplicaMetadata>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRepositoryMetadataResponse {
    #[prost(message, optional, tag = "1")]
    pub metadata: ::core::option::Option<RepositoryMetadata>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DatalossCheckRequest {
    #[prost(string, tag = "1")]
    pub virtual_storage: ::prost::alloc::string::String,
    /// Also report repositories which are fully up to date on their primary
    /// but missing an assigned replica.
    #[prost(bool, tag = "2")]
    pub include_partially_replicated: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DatalossCheckResponse {
    #[prost(message, repeated, tag = "1")]
    pub repositories: ::prost::alloc::vec::Vec<RepositoryMetadata>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetAuthoritativeStorageRequest {
    #[prost(string, tag = "1")]
    pub virtual_storage: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub relative_path: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub authoritative_storage: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SetAuthoritativeStorageResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetReplicationFactorRequest {
    #[prost(string, tag = "1")]
    pub virtual_storage: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub relative_path: ::prost::alloc::string::String,
    #[prost(int32, tag = "3")]
    pub replication_factor: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetReplicationFactorResponse {
    /// The assigned storages after the change.
    #[prost(string, repeated, tag = "1")]
    pub storages: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRepositoryReplicasRequest {
    #[prost(string, tag = "1")]
    pub virtual_storage: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub relative_path: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRepositoryReplicasResponse {
    #[prost(message, repeated, tag = "1")]
    pub replicas: ::prost::alloc::vec::Vec<ReplicaMetadata>,
}
