//! The `vault` protocol spoken by storage nodes. The proxy forwards most of
//! this surface as opaque byte frames; the messages here are the subset the
//! proxy itself constructs, to replicate repositories and run maintenance
//! against individual nodes.

use tonic::codegen::{Body, Bytes, StdError};

/// A repository addressed by the storage holding it and its path within
/// that storage. Embedded in every repository-scoped request.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Repository {
    #[prost(string, tag = "1")]
    pub storage_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub relative_path: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateRepositoryRequest {
    /// The repository to create or update on the receiving storage.
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
    /// The up-to-date source replica to fetch from.
    #[prost(message, optional, tag = "2")]
    pub source: ::core::option::Option<Repository>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReplicateRepositoryResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveRepositoryRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RemoveRepositoryResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RenameRepositoryRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
    #[prost(string, tag = "2")]
    pub new_relative_path: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RenameRepositoryResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RepositoryExistsRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RepositoryExistsResponse {
    #[prost(bool, tag = "1")]
    pub exists: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GarbageCollectRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
    #[prost(bool, tag = "2")]
    pub prune: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct GarbageCollectResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RepackFullRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
    #[prost(bool, tag = "2")]
    pub create_bitmap: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RepackFullResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RepackIncrementalRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RepackIncrementalResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CleanupRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CleanupResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PackRefsRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PackRefsResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteCommitGraphRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct WriteCommitGraphResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MidxRepackRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct MidxRepackResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OptimizeRepositoryRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: ::core::option::Option<Repository>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct OptimizeRepositoryResponse {}

macro_rules! unary {
    ($name:ident, $request:ty, $response:ty, $path:expr) => {
        pub async fn $name(
            &mut self,
            request: $request,
        ) -> Result<tonic::Response<$response>, tonic::Status> {
            self.inner.ready().await.map_err(|err| {
                tonic::Status::unavailable(format!("storage node was not ready: {}", err.into()))
            })?;
            let codec: tonic::codec::ProstCodec<$request, $response> =
                tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static($path);
            self.inner
                .unary(tonic::Request::new(request), path, codec)
                .await
        }
    };
}

/// Client for `vault.RepositoryService`.
#[derive(Clone, Debug)]
pub struct RepositoryServiceClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> RepositoryServiceClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    unary!(
        replicate_repository,
        ReplicateRepositoryRequest,
        ReplicateRepositoryResponse,
        "/vault.RepositoryService/ReplicateRepository"
    );
    unary!(
        remove_repository,
        RemoveRepositoryRequest,
        RemoveRepositoryResponse,
        "/vault.RepositoryService/RemoveRepository"
    );
    unary!(
        rename_repository,
        RenameRepositoryRequest,
        RenameRepositoryResponse,
        "/vault.RepositoryService/RenameRepository"
    );
    unary!(
        repository_exists,
        RepositoryExistsRequest,
        RepositoryExistsResponse,
        "/vault.RepositoryService/RepositoryExists"
    );
    unary!(
        garbage_collect,
        GarbageCollectRequest,
        GarbageCollectResponse,
        "/vault.RepositoryService/GarbageCollect"
    );
    unary!(
        repack_full,
        RepackFullRequest,
        RepackFullResponse,
        "/vault.RepositoryService/RepackFull"
    );
    unary!(
        repack_incremental,
        RepackIncrementalRequest,
        RepackIncrementalResponse,
        "/vault.RepositoryService/RepackIncremental"
    );
    unary!(
        cleanup,
        CleanupRequest,
        CleanupResponse,
        "/vault.RepositoryService/Cleanup"
    );
    unary!(
        pack_refs,
        PackRefsRequest,
        PackRefsResponse,
        "/vault.RepositoryService/PackRefs"
    );
    unary!(
        write_commit_graph,
        WriteCommitGraphRequest,
        WriteCommitGraphResponse,
        "/vault.RepositoryService/WriteCommitGraph"
    );
    unary!(
        midx_repack,
        MidxRepackRequest,
        MidxRepackResponse,
        "/vault.RepositoryService/MidxRepack"
    );
    unary!(
        optimize_repository,
        OptimizeRepositoryRequest,
        OptimizeRepositoryResponse,
        "/vault.RepositoryService/OptimizeRepository"
    );
}
