//! Durable state shared by every proxy instance: the repository store
//! (generations, assignments, per-repository primaries), the replication
//! event queue, node health observations, and the legacy shard primary
//! records.
//!
//! Each store has two implementations behind a common trait: an in-memory
//! one for tests and single-process deployments, and a Postgres one in which
//! every logical operation is a single SQL transaction. The stores are the
//! source of truth for all routing decisions.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

mod memory;
pub mod postgres;
mod types;

pub use memory::{MemoryNodeStore, MemoryQueue, MemoryRepositoryStore};
pub use postgres::{PgNodeStore, PgQueue, PgRepositoryStore};
pub use types::{
    ChangeType, JobState, PrimaryRecord, ReplicaRecord, ReplicationEvent, ReplicationJob,
    RepositoryInfo, ShardPrimary, GENERATION_UNKNOWN,
};

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("repository {virtual_storage:?}/{relative_path:?} not found")]
    RepositoryNotFound {
        virtual_storage: String,
        relative_path: String,
    },
    #[error("repository already exists")]
    AlreadyExists,
    #[error("write was attempted on an outdated primary")]
    WriteToOutdated,
    #[error("attempted downgrade of {storage} from generation {current} to {attempted}")]
    DowngradeAttempted {
        storage: String,
        current: i64,
        attempted: i64,
    },
    #[error("no rows were affected")]
    NoRowsAffected,
    #[error("replication event has no attempts left and must be acknowledged as dead")]
    AttemptsExhausted,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

pub type Result<T, E = DatastoreError> = std::result::Result<T, E>;

/// Durable FIFO-with-locking of replication jobs.
///
/// Ordering is FIFO by id within a single `lock_id`; there is no cross-lock
/// ordering. At most one event per `lock_id` is in progress at any time.
#[async_trait::async_trait]
pub trait ReplicationQueue: Send + Sync {
    /// Persists `job` as a new `ready` event with three attempts.
    async fn enqueue(&self, job: ReplicationJob) -> Result<ReplicationEvent>;

    /// Marks up to `count` ready or failed events targeting
    /// `(virtual_storage, target_storage)` as in-progress, decrementing their
    /// attempt counters. Events whose `lock_id` already has an in-progress
    /// event are skipped.
    async fn dequeue(
        &self,
        virtual_storage: &str,
        target_storage: &str,
        count: usize,
    ) -> Result<Vec<ReplicationEvent>>;

    /// Transitions in-progress events to `state`, returning the ids that
    /// were actually transitioned. Completing an `update` job also removes
    /// later ready events with an identical job payload created before the
    /// completed event's `updated_at`.
    async fn acknowledge(&self, state: JobState, ids: &[i64]) -> Result<Vec<i64>>;

    /// Bumps `updated_at` on the listed in-progress events to mark them as
    /// still owned, returning the ids still held.
    async fn touch(&self, ids: &[i64]) -> Result<Vec<i64>>;

    /// Moves in-progress events not touched within `stale_after` back to
    /// `failed` (or `dead` once attempts are exhausted). Returns the number
    /// of events swept.
    async fn acknowledge_stale(&self, stale_after: Duration) -> Result<u64>;

    /// Non-terminal (ready, in-progress or failed) events of one
    /// repository, consulted by the reconciler before enqueueing repairs.
    async fn active_events(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<ReplicationEvent>>;
}

/// Durable record of every repository: its generation per storage, its
/// assigned host storages, and its current primary.
#[async_trait::async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn create_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        updated_secondaries: &[String],
        outdated_secondaries: &[String],
        store_primary: bool,
        store_assignments: bool,
    ) -> Result<()>;

    /// Upserts the replica to exactly `generation`. Downgrades are allowed;
    /// this is the authoritative-reset path.
    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: i64,
    ) -> Result<()>;

    /// Atomically advances the repository generation by one, carrying the
    /// primary and every listed secondary which was up to date along with
    /// it. Returns the new generation.
    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        secondaries: &[String],
    ) -> Result<i64>;

    /// Replica generation on `storage`, or [GENERATION_UNKNOWN] when the
    /// storage holds no copy.
    async fn get_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<i64>;

    /// The source generation to replicate, provided it does not downgrade
    /// the target.
    async fn get_replicated_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        source: &str,
        target: &str,
    ) -> Result<i64>;

    /// Storages holding the highest generation observed for the repository.
    async fn get_consistent_storages(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<BTreeSet<String>>;

    async fn repository_exists(&self, virtual_storage: &str, relative_path: &str) -> Result<bool>;

    /// Removes the repository record and the listed replica rows. Replicas
    /// not listed are left for the reconciler to clean up.
    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storages: &[String],
    ) -> Result<()>;

    /// Removes a single replica row without touching the repository record.
    async fn delete_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<()>;

    async fn rename_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        new_relative_path: &str,
    ) -> Result<()>;

    /// Forces `storage` ahead of every other replica: its replica and the
    /// repository both move to `generation + 1`.
    async fn set_authoritative_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<()>;

    async fn get_partially_available_repositories(
        &self,
        virtual_storage: &str,
    ) -> Result<Vec<RepositoryInfo>>;

    /// Every repository of the virtual storage, with replica and assignment
    /// state.
    async fn list_repositories(&self, virtual_storage: &str) -> Result<Vec<RepositoryInfo>>;

    /// Replica rows whose repository record no longer exists, as
    /// `(relative_path, storage)` pairs.
    async fn orphaned_replicas(&self, virtual_storage: &str) -> Result<Vec<(String, String)>>;

    async fn repository_metadata(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryInfo>;

    /// Assigned host storages. Falls back to every configured storage while
    /// no explicit assignments exist.
    async fn get_host_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<String>>;

    /// Grows or shrinks the assignment set to `replication_factor`,
    /// assigning and unassigning at random but never touching the primary.
    /// Returns the resulting assignments.
    async fn set_replication_factor(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        replication_factor: usize,
    ) -> Result<Vec<String>>;

    async fn get_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<PrimaryRecord>;

    /// Installs `candidate` as primary iff there is none, the incumbent has
    /// aged past `failover_timeout`, or the incumbent equals `candidate`.
    /// Returns the primary in effect after the call, which may be a
    /// concurrently-elected competitor.
    async fn elect_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        candidate: &str,
        failover_timeout: Duration,
    ) -> Result<String>;

    /// Total generation lag per storage across all repositories of the
    /// virtual storage, used to rank election candidates.
    async fn storage_lag(&self, virtual_storage: &str) -> Result<HashMap<String, i64>>;
}

/// Health observations reported by every proxy instance.
#[async_trait::async_trait]
pub trait NodeStatusStore: Send + Sync {
    /// Records a probe attempt by `proxy_name`; bumps `last_seen_active_at`
    /// only when the probe succeeded.
    async fn update_status(
        &self,
        proxy_name: &str,
        virtual_storage: &str,
        storage: &str,
        active: bool,
    ) -> Result<()>;

    /// The consensus healthy set: per virtual storage, the storages which a
    /// majority of proxy instances active within `activity_window` have seen
    /// alive within `health_window`.
    async fn healthy_storages(
        &self,
        health_window: Duration,
        activity_window: Duration,
    ) -> Result<HashMap<String, BTreeSet<String>>>;
}

/// The legacy per-virtual-storage primary records.
#[async_trait::async_trait]
pub trait ShardPrimaryStore: Send + Sync {
    async fn get_shard_primary(&self, virtual_storage: &str) -> Result<Option<ShardPrimary>>;

    /// Installs `node` as the shard primary when there is none or the
    /// incumbent's election aged past `failover_timeout`. A change of
    /// primary retains the previous one and marks the shard demoted
    /// (read-only) until the demotion is cleared.
    async fn elect_shard_primary(
        &self,
        virtual_storage: &str,
        node: &str,
        elected_by: &str,
        failover_timeout: Duration,
    ) -> Result<ShardPrimary>;

    /// Operator acknowledgement of dataloss: clears the read-only demotion.
    async fn clear_demotion(&self, virtual_storage: &str) -> Result<()>;
}

pub(crate) fn is_past(at: Option<DateTime<Utc>>, window: Duration) -> bool {
    match at {
        None => true,
        Some(at) => {
            Utc::now().signed_duration_since(at)
                > chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::MAX)
        }
    }
}
