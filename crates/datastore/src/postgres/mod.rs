//! Postgres-backed stores shared by every proxy instance. Each logical
//! operation runs as a single SQL transaction; the database is the source of
//! truth for all routing decisions.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;

pub mod listener;
mod node_status;
mod queue;
mod repository;
pub mod schema;

pub use listener::ConsistentStoragesCache;

/// Connects a pool suitable for both the serving path and the management
/// subcommands.
pub async fn connect(database_url: &str) -> crate::Result<PgPool> {
    Ok(sqlx::postgres::PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await?)
}

/// Postgres [crate::ReplicationQueue].
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Postgres [crate::RepositoryStore].
#[derive(Clone)]
pub struct PgRepositoryStore {
    pool: PgPool,
    configured: HashMap<String, Vec<String>>,
    cache: Option<Arc<ConsistentStoragesCache>>,
}

impl PgRepositoryStore {
    /// `configured` maps each virtual storage to its physical storages; the
    /// set doubles as the implicit assignment of repositories without
    /// explicit assignment rows.
    pub fn new(pool: PgPool, configured: HashMap<String, Vec<String>>) -> Self {
        Self {
            pool,
            configured,
            cache: None,
        }
    }

    /// Serves consistent-storage reads from `cache` while its listener is
    /// connected.
    pub fn with_cache(mut self, cache: Arc<ConsistentStoragesCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Postgres [crate::NodeStatusStore] and [crate::ShardPrimaryStore].
#[derive(Clone)]
pub struct PgNodeStore {
    pool: PgPool,
}

impl PgNodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}
