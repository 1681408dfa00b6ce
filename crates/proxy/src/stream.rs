use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Status, Streaming};

use crate::RawCodec;

/// Destination channels carry bounded backpressure back to the client read
/// loop.
const FORWARD_BUFFER: usize = 16;

/// One forwarding target of a proxied RPC.
pub struct Destination {
    pub storage: String,
    pub channel: Channel,
    /// Injected ahead of the client's remaining frames; carries the
    /// destination-specific storage rewrite.
    pub first_frame: Bytes,
    /// Per-destination request metadata (vote routing and the original
    /// client metadata).
    pub metadata: tonic::metadata::MetadataMap,
    /// Invoked with a secondary's receive error. Never called for the
    /// primary, whose errors surface to the client directly.
    pub on_error: Option<Box<dyn FnOnce(Status) + Send>>,
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("storage", &self.storage)
            .field("first_frame", &self.first_frame)
            .field("metadata", &self.metadata)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// What the stream handler observed, handed to the request finalizer.
#[derive(Debug, Clone)]
pub struct RpcOutcome {
    pub primary_ok: bool,
}

/// Post-RPC bookkeeping. Runs exactly once, after the primary and every
/// secondary stream have drained and before the client sees trailers.
pub type RequestFinalizer =
    Box<dyn FnOnce(RpcOutcome) -> BoxFuture<'static, Result<(), Status>> + Send>;

pub struct StreamParameters {
    /// Full method path, e.g. `/vault.RefService/UpdateReferences`.
    pub method: String,
    pub primary: Destination,
    pub secondaries: Vec<Destination>,
    pub finalizer: Option<RequestFinalizer>,
}

impl std::fmt::Debug for StreamParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamParameters")
            .field("method", &self.method)
            .field("primary", &self.primary)
            .field("secondaries", &self.secondaries)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// Fans the inbound client stream out per [StreamParameters], returning the
/// stream of response frames for the client. Cancellation is cooperative:
/// dropping the returned stream tears down every destination stream.
pub fn proxy_frames(
    params: StreamParameters,
    inbound: Streaming<Bytes>,
) -> ReceiverStream<Result<Bytes, Status>> {
    let (out_tx, out_rx) = mpsc::channel(FORWARD_BUFFER);

    tokio::spawn(async move {
        let gone = out_tx.clone();
        let result = tokio::select! {
            result = drive(params, inbound, &out_tx) => result,
            // The client went away: dropping `drive` cancels every
            // destination stream.
            () = gone.closed() => Err(Status::cancelled("client cancelled the call")),
        };
        if let Err(status) = result {
            let _ = out_tx.send(Err(status)).await;
        }
    });

    ReceiverStream::new(out_rx)
}

struct OpenStream {
    storage: String,
    responses: Streaming<Bytes>,
    on_error: Option<Box<dyn FnOnce(Status) + Send>>,
}

async fn drive(
    params: StreamParameters,
    inbound: Streaming<Bytes>,
    out: &mpsc::Sender<Result<Bytes, Status>>,
) -> Result<(), Status> {
    let StreamParameters {
        method,
        primary,
        secondaries,
        mut finalizer,
    } = params;

    let path: http::uri::PathAndQuery = method
        .parse()
        .map_err(|_| Status::internal(format!("invalid method path {method:?}")))?;

    // Open every destination stream, each pre-seeded with its rewritten
    // first frame. A primary which cannot be reached fails the call before
    // any frame moves; an unreachable secondary surfaces as Internal only
    // after the primary has finished.
    let mut senders = Vec::with_capacity(1 + secondaries.len());
    let mut open_primary = None;
    let mut open_secondaries = Vec::with_capacity(secondaries.len());
    let mut secondary_failure: Option<Status> = None;

    for (is_primary, destination) in std::iter::once((true, primary))
        .chain(secondaries.into_iter().map(|destination| (false, destination)))
    {
        let storage = destination.storage.clone();
        match open_destination(destination, &path).await {
            Ok((open, sender)) => {
                senders.push(sender);
                if is_primary {
                    open_primary = Some(open);
                } else {
                    open_secondaries.push(open);
                }
            }
            Err((status, _on_error)) if is_primary => {
                if let Err(err) = finalize(&mut finalizer, RpcOutcome { primary_ok: false }).await {
                    tracing::warn!(%err, "request finalizer failed");
                }
                return Err(status);
            }
            Err((status, on_error)) => {
                tracing::warn!(%storage, %status, "failed to open secondary stream");
                if let Some(on_error) = on_error {
                    on_error(status.clone());
                }
                secondary_failure.get_or_insert(status);
            }
        }
    }
    let mut open_primary = open_primary.expect("primary stream was opened");

    // Client frames fan out to every destination in FIFO order. The
    // forwarder owns the senders: when it finishes on client EOF they drop,
    // which ends each destination's request stream.
    let forward = forward_client_frames(inbound, senders);
    tokio::pin!(forward);

    let pumps = async {
        tokio::join!(
            pump_primary(&mut open_primary.responses, out),
            futures::future::join_all(open_secondaries.into_iter().map(drain_secondary)),
        )
    };
    tokio::pin!(pumps);

    let (client_error, primary_result, secondary_results) = tokio::select! {
        (primary_result, secondary_results) = &mut pumps => {
            (None, primary_result, secondary_results)
        }
        forward_result = &mut forward => match forward_result {
            // Client EOF: destinations wind down and the pumps complete.
            Ok(()) => {
                let (primary_result, secondary_results) = pumps.await;
                (None, primary_result, secondary_results)
            }
            // A client receive error cancels every destination.
            Err(status) => (Some(status), Err(Status::cancelled("call aborted")), Vec::new()),
        },
    };

    let outcome = RpcOutcome {
        primary_ok: client_error.is_none() && primary_result.is_ok(),
    };
    let finalizer_result = finalize(&mut finalizer, outcome).await;

    // Precedence: the client's own failure, then the primary's status with
    // its trailers intact, then secondary failures as Internal, then any
    // finalizer failure.
    if let Some(status) = client_error {
        return Err(Status::internal(format!(
            "failed reading from the client stream: {}",
            status.message()
        )));
    }
    primary_result?;
    if let Some(status) = secondary_failure.or_else(|| {
        secondary_results
            .into_iter()
            .find_map(|result| result.err())
    }) {
        return Err(Status::internal(format!(
            "replica stream failed: {}",
            status.message()
        )));
    }
    finalizer_result
}

async fn finalize(
    finalizer: &mut Option<RequestFinalizer>,
    outcome: RpcOutcome,
) -> Result<(), Status> {
    match finalizer.take() {
        Some(finalizer) => finalizer(outcome).await,
        None => Ok(()),
    }
}

type OpenError = (Status, Option<Box<dyn FnOnce(Status) + Send>>);

async fn open_destination(
    destination: Destination,
    path: &http::uri::PathAndQuery,
) -> Result<(OpenStream, mpsc::Sender<Bytes>), OpenError> {
    let Destination {
        storage,
        channel,
        first_frame,
        metadata,
        mut on_error,
    } = destination;

    let (sender, receiver) = mpsc::channel::<Bytes>(FORWARD_BUFFER);
    sender
        .send(first_frame)
        .await
        .expect("fresh channel accepts the first frame");

    let mut grpc = tonic::client::Grpc::new(channel);
    if let Err(err) = grpc.ready().await {
        let status = Status::unavailable(format!("storage node was not ready: {err}"));
        return Err((status, on_error.take()));
    }

    let mut request = tonic::Request::new(ReceiverStream::new(receiver));
    *request.metadata_mut() = metadata;

    match grpc.streaming(request, path.clone(), RawCodec).await {
        Ok(responses) => Ok((
            OpenStream {
                storage,
                responses: responses.into_inner(),
                on_error,
            },
            sender,
        )),
        Err(status) => Err((status, on_error.take())),
    }
}

/// Duplicates every client frame to every destination. A destination whose
/// stream already ended simply stops receiving. Returns on client EOF, or
/// with the client's receive error.
async fn forward_client_frames(
    mut inbound: Streaming<Bytes>,
    senders: Vec<mpsc::Sender<Bytes>>,
) -> Result<(), Status> {
    loop {
        match inbound.message().await? {
            Some(frame) => {
                for sender in &senders {
                    let _ = sender.send(frame.clone()).await;
                }
            }
            None => return Ok(()),
        }
    }
}

/// Streams the primary's responses back to the client.
async fn pump_primary(
    responses: &mut Streaming<Bytes>,
    out: &mpsc::Sender<Result<Bytes, Status>>,
) -> Result<(), Status> {
    loop {
        match responses.message().await? {
            Some(frame) => {
                if out.send(Ok(frame)).await.is_err() {
                    return Err(Status::cancelled("client cancelled the call"));
                }
            }
            None => return Ok(()),
        }
    }
}

/// Reads a secondary to completion, discarding its responses.
async fn drain_secondary(mut open: OpenStream) -> Result<(), Status> {
    loop {
        match open.responses.message().await {
            Ok(Some(_frame)) => continue,
            Ok(None) => return Ok(()),
            Err(status) => {
                tracing::warn!(storage = %open.storage, %status, "secondary stream failed");
                if let Some(on_error) = open.on_error.take() {
                    on_error(status.clone());
                }
                return Err(status);
            }
        }
    }
}
