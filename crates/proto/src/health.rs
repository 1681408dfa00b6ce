//! The standard `grpc.health.v1` protocol, used to probe storage nodes.

use tonic::codegen::{Body, Bytes, StdError};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
}

pub const CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";

/// Client for `grpc.health.v1.Health`.
#[derive(Clone, Debug)]
pub struct HealthClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> HealthClient<T>
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

    pub async fn check(
        &mut self,
        request: HealthCheckRequest,
    ) -> Result<tonic::Response<HealthCheckResponse>, tonic::Status> {
        self.inner.ready().await.map_err(|err| {
            tonic::Status::unavailable(format!("health service was not ready: {}", err.into()))
        })?;
        let codec: tonic::codec::ProstCodec<HealthCheckRequest, HealthCheckResponse> =
            tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(CHECK_METHOD);
        self.inner
            .unary(tonic::Request::new(request), path, codec)
            .await
    }
}
