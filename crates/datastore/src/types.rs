use chrono::{DateTime, Utc};

/// Sentinel generation of a storage which holds no copy of a repository.
pub const GENERATION_UNKNOWN: i64 = -1;

/// The kind of change a replication job applies to its target storage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Update,
    Create,
    Delete,
    DeleteReplica,
    Rename,
    Gc,
    RepackFull,
    RepackIncremental,
    Cleanup,
    PackRefs,
    WriteCommitGraph,
    MidxRepack,
    Optimize,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Update => "update",
            ChangeType::Create => "create",
            ChangeType::Delete => "delete",
            ChangeType::DeleteReplica => "delete_replica",
            ChangeType::Rename => "rename",
            ChangeType::Gc => "gc",
            ChangeType::RepackFull => "repack_full",
            ChangeType::RepackIncremental => "repack_incremental",
            ChangeType::Cleanup => "cleanup",
            ChangeType::PackRefs => "pack_refs",
            ChangeType::WriteCommitGraph => "write_commit_graph",
            ChangeType::MidxRepack => "midx_repack",
            ChangeType::Optimize => "optimize",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    InProgress,
    Failed,
    Dead,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::InProgress => "in_progress",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ready" => JobState::Ready,
            "in_progress" => JobState::InProgress,
            "failed" => JobState::Failed,
            "dead" => JobState::Dead,
            "completed" => JobState::Completed,
            "cancelled" => JobState::Cancelled,
            _ => return None,
        })
    }

    /// States an in-progress event may be acknowledged into.
    pub fn is_acknowledgement(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Dead | JobState::Cancelled
        )
    }
}

/// A replication job: apply `change` to `relative_path` on `target_storage`,
/// fetching from `source_storage` where the change needs a source.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReplicationJob {
    pub change: ChangeType,
    pub virtual_storage: String,
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_storage: Option<String>,
    pub target_storage: String,
    /// Change-specific parameters, e.g. the new path of a rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl ReplicationJob {
    /// Serialization key of the queue's per-target mutual exclusion.
    pub fn lock_id(&self) -> String {
        format!(
            "{}|{}|{}",
            self.virtual_storage, self.target_storage, self.relative_path
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationEvent {
    pub id: i64,
    pub state: JobState,
    pub attempt: i32,
    pub lock_id: String,
    pub job: ReplicationJob,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A single replica row as reported by metadata queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaRecord {
    pub storage: String,
    pub generation: i64,
    pub assigned: bool,
}

/// Full repository state used by dataloss reporting and the admin surface.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryInfo {
    pub virtual_storage: String,
    pub relative_path: String,
    pub generation: i64,
    pub primary: Option<String>,
    pub replicas: Vec<ReplicaRecord>,
}

impl RepositoryInfo {
    /// Whether some assigned replica is missing the latest generation.
    pub fn is_partially_available(&self) -> bool {
        self.replicas
            .iter()
            .any(|r| r.assigned && r.generation < self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrimaryRecord {
    /// The elected storage; `None` means demoted, writes blocked.
    pub storage: Option<String>,
    pub elected_at: Option<DateTime<Utc>>,
}

/// Legacy per-virtual-storage primary election record.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardPrimary {
    pub node: String,
    pub elected_by: String,
    pub elected_at: DateTime<Utc>,
    /// Set on failover; the virtual storage is read-only while demoted.
    pub demoted: bool,
    pub previous_writable_primary: Option<String>,
}
