//! The serving path: store construction, background loops, listeners and
//! graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use coordinator::{AdminHandlers, ProxyService, StreamDirector};
use datastore::{
    MemoryNodeStore, MemoryQueue, MemoryRepositoryStore, NodeStatusStore, PgNodeStore, PgQueue,
    PgRepositoryStore, ReplicationQueue, RepositoryStore, ShardPrimaryStore,
};
use election::{PerRepositoryElector, PerVirtualStorageElector, PrimaryGetter};
use futures::FutureExt;
use nodes::{HealthManager, HealthOptions, NodeSet};
use protocol::Registry;
use replication::{
    GrpcReplicator, Reconciler, ReconcilerOptions, ReplicationManager, ReplicationOptions,
};
use router::Router;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use transactions::TransactionManager;

use crate::config::{Config, ElectionStrategy};

struct Stores {
    repositories: Arc<dyn RepositoryStore>,
    queue: Arc<dyn ReplicationQueue>,
    node_status: Arc<dyn NodeStatusStore>,
    shard_primaries: Arc<dyn ShardPrimaryStore>,
    /// Keeps the notification listener alive for the process lifetime.
    listener: Option<tokio::task::JoinHandle<()>>,
}

async fn build_stores(config: &Config) -> anyhow::Result<Stores> {
    let configured = config.configured_storages();

    match &config.database {
        Some(database) => {
            let pool = datastore::postgres::connect(&database.url)
                .await
                .context("failed to connect to the durable backend")?;

            let cache = Arc::new(datastore::postgres::ConsistentStoragesCache::new());
            let listener = tokio::spawn(datastore::postgres::listener::run(
                pool.clone(),
                cache.clone(),
            ));

            let node_store = Arc::new(PgNodeStore::new(pool.clone()));
            Ok(Stores {
                repositories: Arc::new(
                    PgRepositoryStore::new(pool.clone(), configured).with_cache(cache),
                ),
                queue: Arc::new(PgQueue::new(pool)),
                node_status: node_store.clone(),
                shard_primaries: node_store,
                listener: Some(listener),
            })
        }
        None => {
            // Single-instance deployment: process-local state only.
            tracing::warn!(
                "no database is configured; replication state will not survive a restart \
                 and cannot be shared with other proxy instances"
            );
            let node_store = Arc::new(MemoryNodeStore::new());
            Ok(Stores {
                repositories: Arc::new(MemoryRepositoryStore::new(configured)),
                queue: Arc::new(MemoryQueue::new()),
                node_status: node_store.clone(),
                shard_primaries: node_store,
                listener: None,
            })
        }
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let proxy_name = config.proxy_name();
    tracing::info!(%proxy_name, "starting");

    let nodes = Arc::new(NodeSet::dial(&config.node_configs())?);
    let stores = build_stores(&config).await?;

    let health_manager = HealthManager::new(
        proxy_name.clone(),
        nodes.clone(),
        stores.node_status.clone(),
        HealthOptions::default(),
    );
    let health = Arc::new(health_manager.snapshot());

    let failover = &config.failover;
    let mut legacy_elector = None;
    let primaries: Arc<dyn PrimaryGetter> = match failover.election_strategy {
        ElectionStrategy::PerRepository => Arc::new(PerRepositoryElector::new(
            stores.repositories.clone(),
            health.clone(),
            failover.failover_timeout,
        )),
        ElectionStrategy::PerVirtualStorage => {
            let elector = Arc::new(PerVirtualStorageElector::new(
                stores.shard_primaries.clone(),
                health.clone(),
                proxy_name.clone(),
                failover.failover_timeout,
            ));
            legacy_elector = Some(elector.clone());
            elector
        }
    };

    let mut router = Router::new(
        nodes.clone(),
        stores.repositories.clone(),
        health.clone(),
        primaries,
        config.default_replication_factor,
    );
    if let Some(elector) = legacy_elector {
        router = router.with_legacy_elector(elector);
    }
    let router = Arc::new(router);

    let transactions = TransactionManager::new();
    let director = StreamDirector::new(
        Arc::new(Registry::new()),
        router,
        stores.repositories.clone(),
        stores.queue.clone(),
        transactions.clone(),
        config.advertise_addr(),
    );
    let admin = AdminHandlers::new(
        stores.repositories.clone(),
        health.clone(),
        config.configured_storages(),
    );
    let service = ProxyService::new(director, transactions, admin);

    let replication_manager = Arc::new(ReplicationManager::new(
        nodes.clone(),
        health.clone(),
        stores.queue.clone(),
        stores.repositories.clone(),
        Arc::new(GrpcReplicator::new()),
        ReplicationOptions::default(),
    ));
    let reconciler = Reconciler::new(
        nodes.clone(),
        health.clone(),
        stores.queue.clone(),
        stores.repositories.clone(),
        ReconcilerOptions::default(),
    );

    let shutdown = CancellationToken::new();
    let background = TaskTracker::new();
    {
        let token = shutdown.clone();
        background.spawn(async move { health_manager.serve(token.cancelled_owned()).await });
    }
    {
        let token = shutdown.clone();
        background
            .spawn(async move { replication_manager.serve(token.cancelled_owned()).await });
    }
    {
        let token = shutdown.clone();
        background.spawn(async move { reconciler.serve(token.cancelled_owned()).await });
    }
    if let Some(addr) = &config.prometheus_listen_addr {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
        let token = shutdown.clone();
        background.spawn(serve_metrics(listener, token));
    }
    background.close();

    let connections = TaskTracker::new();
    let accept = accept_loops(&config, service, connections.clone()).await?;

    // Serve until asked to stop.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for interrupts")?;
            tracing::info!("received interrupt");
        }
        () = accept => anyhow::bail!("listeners stopped unexpectedly"),
    }

    // Stop accepting, then drain in-flight calls up to the configured
    // timeout before tearing the process down.
    shutdown.cancel();
    connections.close();
    tracing::info!(
        timeout = ?config.graceful_stop_timeout,
        in_flight = connections.len(),
        "draining connections"
    );
    if tokio::time::timeout(config.graceful_stop_timeout, connections.wait())
        .await
        .is_err()
    {
        tracing::warn!("graceful stop timed out; aborting remaining connections");
    }
    background.wait().await;

    if let Some(listener) = stores.listener {
        listener.abort();
    }
    Ok(())
}

/// Binds every configured listener and returns a future which accepts
/// connections until any listener fails.
async fn accept_loops(
    config: &Config,
    service: ProxyService,
    connections: TaskTracker,
) -> anyhow::Result<impl std::future::Future<Output = ()>> {
    let mut loops = Vec::new();

    let tcp = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "listening");
    loops.push(accept_tcp(tcp, None, service.clone(), connections.clone()).boxed());

    if let Some(addr) = &config.tls_listen_addr {
        let tls = config
            .tls
            .as_ref()
            .context("tls_listen_addr requires a [tls] section")?;
        let acceptor = tls_acceptor(tls)?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(%addr, "listening (tls)");
        loops.push(accept_tcp(listener, Some(acceptor), service.clone(), connections.clone()).boxed());
    }

    if let Some(path) = &config.socket_path {
        // A stale socket file from a previous run blocks the bind.
        match std::fs::remove_file(path) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove {}", path.display()))
            }
        }
        let listener = tokio::net::UnixListener::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        tracing::info!(path = %path.display(), "listening (unix)");
        loops.push(accept_unix(listener, service.clone(), connections.clone()).boxed());
    }

    Ok(futures::future::select_all(loops).map(|_| ()))
}

fn tls_acceptor(tls: &crate::config::TlsConfig) -> anyhow::Result<tokio_rustls::TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(&tls.certificate_path)
            .with_context(|| format!("failed to open {}", tls.certificate_path.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("failed to parse TLS certificates")?;

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(&tls.key_path)
            .with_context(|| format!("failed to open {}", tls.key_path.display()))?,
    ))
    .context("failed to parse TLS key")?
    .context("no private key found")?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate or key")?;
    server_config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}

async fn accept_tcp(
    listener: tokio::net::TcpListener,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    service: ProxyService,
    connections: TaskTracker,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!(?err, "failed to accept connection");
                return;
            }
        };
        let service = service.clone();
        let acceptor = acceptor.clone();

        connections.spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, service).await,
                    Err(err) => {
                        tracing::debug!(%peer, ?err, "TLS handshake failed");
                        return;
                    }
                },
                None => serve_connection(stream, service).await,
            };
            if let Err(err) = result {
                tracing::debug!(%peer, ?err, "connection ended with an error");
            }
        });
    }
}

async fn accept_unix(
    listener: tokio::net::UnixListener,
    service: ProxyService,
    connections: TaskTracker,
) {
    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!(?err, "failed to accept unix connection");
                return;
            }
        };
        let service = service.clone();
        connections.spawn(async move {
            if let Err(err) = serve_connection(stream, service).await {
                tracing::debug!(?err, "unix connection ended with an error");
            }
        });
    }
}

async fn serve_connection<S>(
    stream: S,
    service: ProxyService,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
        .serve_connection(
            hyper_util::rt::TokioIo::new(stream),
            hyper_util::service::TowerToHyperService::new(service),
        )
        .await
}

async fn serve_metrics(listener: tokio::net::TcpListener, shutdown: CancellationToken) {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(|| async {
            let encoder = prometheus::TextEncoder::new();
            match encoder.encode_to_string(&prometheus::gather()) {
                Ok(body) => (axum::http::StatusCode::OK, body),
                Err(err) => (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    err.to_string(),
                ),
            }
        }),
    );

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(?err, "metrics listener failed");
    }
}
