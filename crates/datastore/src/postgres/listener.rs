//! Cache of consistent-storage reads, kept coherent by Postgres
//! notifications. The triggers installed by the schema publish every
//! repository and replica row change on the `repositories_updates` and
//! `storage_repositories_updates` channels; while the listener is connected
//! the cache serves reads, and any listener failure disables it until the
//! connection is re-established.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;

pub const CHANNELS: &[&str] = &["repositories_updates", "storage_repositories_updates"];

#[derive(serde::Deserialize)]
struct Notification {
    virtual_storage: String,
    relative_path: String,
}

#[derive(Default)]
pub struct ConsistentStoragesCache {
    entries: Mutex<HashMap<(String, String), BTreeSet<String>>>,
    enabled: AtomicBool,
}

impl ConsistentStoragesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, virtual_storage: &str, relative_path: &str) -> Option<BTreeSet<String>> {
        if !self.enabled.load(Ordering::Acquire) {
            return None;
        }
        self.entries
            .lock()
            .unwrap()
            .get(&(virtual_storage.to_string(), relative_path.to_string()))
            .cloned()
    }

    pub fn insert(&self, virtual_storage: &str, relative_path: &str, storages: BTreeSet<String>) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        self.entries.lock().unwrap().insert(
            (virtual_storage.to_string(), relative_path.to_string()),
            storages,
        );
    }

    fn invalidate(&self, virtual_storage: &str, relative_path: &str) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(virtual_storage.to_string(), relative_path.to_string()));
    }

    fn enable(&self) {
        self.entries.lock().unwrap().clear();
        self.enabled.store(true, Ordering::Release);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.entries.lock().unwrap().clear();
    }
}

/// Runs the notification listener until cancelled. The cache is enabled only
/// while subscribed; a dropped connection empties and bypasses it, so stale
/// entries can never serve a routing decision.
pub async fn run(pool: PgPool, cache: std::sync::Arc<ConsistentStoragesCache>) {
    loop {
        match listen_once(&pool, &cache).await {
            Ok(()) => return,
            Err(err) => {
                cache.disable();
                tracing::warn!(?err, "consistent storages listener failed; cache disabled");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn listen_once(
    pool: &PgPool,
    cache: &ConsistentStoragesCache,
) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen_all(CHANNELS.iter().copied()).await?;
    cache.enable();
    tracing::debug!("consistent storages cache enabled");

    loop {
        let notification = listener.recv().await?;
        match serde_json::from_str::<Notification>(notification.payload()) {
            Ok(change) => cache.invalidate(&change.virtual_storage, &change.relative_path),
            Err(err) => {
                // An unparseable payload means cache coherence can no longer
                // be trusted.
                tracing::warn!(?err, payload = notification.payload(), "bad notification");
                cache.disable();
                cache.enable();
            }
        }
    }
}
