//! The proxy's single entry point: a catch-all service which dispatches
//! every inbound gRPC call, serving the intercepted surface itself and
//! fanning everything else out through the stream director.

use std::sync::Arc;
use std::task::{Context, Poll};

use proto::health::{HealthCheckRequest, HealthCheckResponse, ServingStatus};
use proto::palisade::*;
use proxy::RawCodec;
use tonic::codegen::{empty_body, Body, BoxFuture, Bytes, Service, StdError};
use tonic::Status;
use transactions::{TransactionError, TransactionManager, VoteOutcome};

use crate::{AdminHandlers, StreamDirector};

static PROXIED_RPCS: std::sync::LazyLock<prometheus::IntCounterVec> =
    std::sync::LazyLock::new(|| {
        prometheus::register_int_counter_vec!(
            "palisade_rpcs_total",
            "Inbound RPCs by method and dispatch kind.",
            &["method", "kind"]
        )
        .expect("metric registration is infallible at startup")
    });

struct Inner {
    director: StreamDirector,
    transactions: TransactionManager,
    admin: AdminHandlers,
}

#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<Inner>,
}

impl ProxyService {
    pub fn new(
        director: StreamDirector,
        transactions: TransactionManager,
        admin: AdminHandlers,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                director,
                transactions,
                admin,
            }),
        }
    }
}

impl<B> Service<http::Request<B>> for ProxyService
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(dispatch(inner, request).await) })
    }
}

macro_rules! admin_unary {
    ($name:ident, $request:ty, $response:ty, $handler:ident) => {
        struct $name(Arc<Inner>);

        impl tonic::server::UnaryService<$request> for $name {
            type Response = $response;
            type Future = BoxFuture<tonic::Response<Self::Response>, Status>;

            fn call(&mut self, request: tonic::Request<$request>) -> Self::Future {
                let inner = self.0.clone();
                Box::pin(async move {
                    inner
                        .admin
                        .$handler(request.into_inner())
                        .await
                        .map(tonic::Response::new)
                })
            }
        }
    };
}

admin_unary!(
    MetadataSvc,
    GetRepositoryMetadataRequest,
    GetRepositoryMetadataResponse,
    repository_metadata
);
admin_unary!(DatalossSvc, DatalossCheckRequest, DatalossCheckResponse, dataloss_check);
admin_unary!(
    AuthoritativeSvc,
    SetAuthoritativeStorageRequest,
    SetAuthoritativeStorageResponse,
    set_authoritative_storage
);
admin_unary!(
    ReplicationFactorSvc,
    SetReplicationFactorRequest,
    SetReplicationFactorResponse,
    set_replication_factor
);
admin_unary!(
    ReplicasSvc,
    GetRepositoryReplicasRequest,
    GetRepositoryReplicasResponse,
    repository_replicas
);

struct VoteSvc(Arc<Inner>);

impl tonic::server::UnaryService<VoteTransactionRequest> for VoteSvc {
    type Response = VoteTransactionResponse;
    type Future = BoxFuture<tonic::Response<Self::Response>, Status>;

    fn call(&mut self, request: tonic::Request<VoteTransactionRequest>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move {
            let request = request.into_inner();
            let outcome = inner
                .transactions
                .vote(request.transaction_id, &request.node, request.vote_hash)
                .await
                .map_err(transaction_status)?;

            let vote_result = match outcome {
                VoteOutcome::Commit => VoteResult::Commit,
                VoteOutcome::Abort => VoteResult::Abort,
                VoteOutcome::Stop => VoteResult::Stop,
            };
            Ok(tonic::Response::new(VoteTransactionResponse {
                vote_result: vote_result as i32,
            }))
        })
    }
}

struct StopSvc(Arc<Inner>);

impl tonic::server::UnaryService<StopTransactionRequest> for StopSvc {
    type Response = StopTransactionResponse;
    type Future = BoxFuture<tonic::Response<Self::Response>, Status>;

    fn call(&mut self, request: tonic::Request<StopTransactionRequest>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move {
            inner
                .transactions
                .stop(request.into_inner().transaction_id)
                .map_err(transaction_status)?;
            Ok(tonic::Response::new(StopTransactionResponse {}))
        })
    }
}

struct HealthSvc;

impl tonic::server::UnaryService<HealthCheckRequest> for HealthSvc {
    type Response = HealthCheckResponse;
    type Future = BoxFuture<tonic::Response<Self::Response>, Status>;

    fn call(&mut self, _request: tonic::Request<HealthCheckRequest>) -> Self::Future {
        Box::pin(async move {
            Ok(tonic::Response::new(HealthCheckResponse {
                status: ServingStatus::Serving as i32,
            }))
        })
    }
}

struct ProxyStreamSvc {
    inner: Arc<Inner>,
    method: String,
}

impl tonic::server::StreamingService<Bytes> for ProxyStreamSvc {
    type Response = Bytes;
    type ResponseStream = tokio_stream::wrappers::ReceiverStream<Result<Bytes, Status>>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<tonic::Streaming<Bytes>>) -> Self::Future {
        let inner = self.inner.clone();
        let method = self.method.clone();
        Box::pin(async move {
            let (metadata, _extensions, mut inbound) = request.into_parts();

            // Routing needs the first frame; it is re-injected, rewritten
            // per destination, ahead of the remaining client frames.
            let first = inbound
                .message()
                .await?
                .ok_or_else(|| Status::invalid_argument("missing initial request frame"))?;

            let params = inner.director.direct(&method, first, &metadata).await?;
            Ok(tonic::Response::new(proxy::proxy_frames(params, inbound)))
        })
    }
}

async fn dispatch<B>(inner: Arc<Inner>, request: http::Request<B>) -> http::Response<tonic::body::BoxBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    let path = request.uri().path().to_string();

    macro_rules! unary {
        ($svc:expr, $request:ty, $response:ty) => {{
            PROXIED_RPCS
                .with_label_values(&[path.as_str(), "intercepted"])
                .inc();
            let codec: tonic::codec::ProstCodec<$response, $request> =
                tonic::codec::ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            grpc.unary($svc, request).await
        }};
    }

    match path.as_str() {
        VOTE_TRANSACTION_METHOD => {
            unary!(VoteSvc(inner), VoteTransactionRequest, VoteTransactionResponse)
        }
        STOP_TRANSACTION_METHOD => {
            unary!(StopSvc(inner), StopTransactionRequest, StopTransactionResponse)
        }
        REPOSITORY_METADATA_METHOD => unary!(
            MetadataSvc(inner),
            GetRepositoryMetadataRequest,
            GetRepositoryMetadataResponse
        ),
        DATALOSS_CHECK_METHOD => {
            unary!(DatalossSvc(inner), DatalossCheckRequest, DatalossCheckResponse)
        }
        SET_AUTHORITATIVE_STORAGE_METHOD => unary!(
            AuthoritativeSvc(inner),
            SetAuthoritativeStorageRequest,
            SetAuthoritativeStorageResponse
        ),
        SET_REPLICATION_FACTOR_METHOD => unary!(
            ReplicationFactorSvc(inner),
            SetReplicationFactorRequest,
            SetReplicationFactorResponse
        ),
        REPOSITORY_REPLICAS_METHOD => unary!(
            ReplicasSvc(inner),
            GetRepositoryReplicasRequest,
            GetRepositoryReplicasResponse
        ),
        proto::health::CHECK_METHOD => {
            unary!(HealthSvc, HealthCheckRequest, HealthCheckResponse)
        }
        _ => {
            let routable = inner
                .director
                .registry()
                .lookup(&path)
                .is_some_and(|info| !info.is_intercepted());
            if routable {
                PROXIED_RPCS
                    .with_label_values(&[path.as_str(), "proxied"])
                    .inc();
                let method = path.clone();
                let mut grpc = tonic::server::Grpc::new(RawCodec);
                grpc.streaming(ProxyStreamSvc { inner, method }, request)
                    .await
            } else {
                PROXIED_RPCS
                    .with_label_values(&["unknown", "unimplemented"])
                    .inc();
                unimplemented_response()
            }
        }
    }
}

fn unimplemented_response() -> http::Response<tonic::body::BoxBody> {
    let mut response = http::Response::new(empty_body());
    response.headers_mut().insert(
        "grpc-status",
        http::HeaderValue::from_static("12"), // Unimplemented
    );
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    response
}

fn transaction_status(err: TransactionError) -> Status {
    match &err {
        TransactionError::NotFound(_) => Status::not_found(err.to_string()),
        TransactionError::InvalidVote(_) => Status::invalid_argument(err.to_string()),
    }
}
