//! In-memory store implementations. They satisfy the same contracts as the
//! Postgres stores but offer no multi-instance safety: state is scoped to
//! the process and guarded by plain mutexes which are never held across an
//! await point.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use crate::types::*;
use crate::{is_past, DatastoreError, Result};

#[derive(Default)]
struct QueueInner {
    next_id: i64,
    events: BTreeMap<i64, ReplicationEvent>,
}

/// Process-local [crate::ReplicationQueue].
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl crate::ReplicationQueue for MemoryQueue {
    async fn enqueue(&self, job: ReplicationJob) -> Result<ReplicationEvent> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;

        let event = ReplicationEvent {
            id: inner.next_id,
            state: JobState::Ready,
            attempt: 3,
            lock_id: job.lock_id(),
            job,
            created_at: Utc::now(),
            updated_at: None,
        };
        inner.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn dequeue(
        &self,
        virtual_storage: &str,
        target_storage: &str,
        count: usize,
    ) -> Result<Vec<ReplicationEvent>> {
        let mut inner = self.inner.lock().unwrap();

        let mut locked: BTreeSet<String> = inner
            .events
            .values()
            .filter(|event| event.state == JobState::InProgress)
            .map(|event| event.lock_id.clone())
            .collect();

        let picked: Vec<i64> = inner
            .events
            .values()
            .filter(|event| {
                matches!(event.state, JobState::Ready | JobState::Failed)
                    && event.attempt > 0
                    && event.job.virtual_storage == virtual_storage
                    && event.job.target_storage == target_storage
            })
            .filter(|event| {
                // Insertion claims the lock, so one batch never carries two
                // events of the same lock_id.
                locked.insert(event.lock_id.clone())
            })
            .take(count)
            .map(|event| event.id)
            .collect();

        let now = Utc::now();
        let mut dequeued = Vec::with_capacity(picked.len());
        for id in picked {
            let event = inner.events.get_mut(&id).unwrap();
            event.state = JobState::InProgress;
            event.attempt -= 1;
            event.updated_at = Some(now);
            dequeued.push(event.clone());
        }
        Ok(dequeued)
    }

    async fn acknowledge(&self, state: JobState, ids: &[i64]) -> Result<Vec<i64>> {
        if !state.is_acknowledgement() {
            return Err(DatastoreError::InvalidArgument(format!(
                "replication event cannot be acknowledged as {}",
                state.as_str()
            )));
        }

        let mut inner = self.inner.lock().unwrap();

        // The whole acknowledgement is rejected before anything transitions.
        if state == JobState::Failed
            && ids.iter().any(|id| {
                inner
                    .events
                    .get(id)
                    .is_some_and(|event| event.state == JobState::InProgress && event.attempt <= 0)
            })
        {
            return Err(DatastoreError::AttemptsExhausted);
        }

        let now = Utc::now();
        let mut acked = Vec::new();
        let mut completed_updates = Vec::new();

        for id in ids {
            let Some(event) = inner.events.get_mut(id) else {
                continue;
            };
            if event.state != JobState::InProgress {
                continue;
            }

            event.state = state;
            event.updated_at = Some(now);
            acked.push(*id);

            if state == JobState::Completed && event.job.change == ChangeType::Update {
                completed_updates.push((event.job.clone(), now));
            }
        }

        // A completed update supersedes identical ready jobs which were
        // enqueued while it ran.
        for (job, completed_at) in completed_updates {
            inner.events.retain(|_, event| {
                !(event.state == JobState::Ready
                    && event.job == job
                    && event.created_at < completed_at)
            });
        }

        Ok(acked)
    }

    async fn touch(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut touched = Vec::new();
        for id in ids {
            if let Some(event) = inner.events.get_mut(id) {
                if event.state == JobState::InProgress {
                    event.updated_at = Some(now);
                    touched.push(*id);
                }
            }
        }
        Ok(touched)
    }

    async fn acknowledge_stale(&self, stale_after: Duration) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut swept = 0;
        for event in inner.events.values_mut() {
            if event.state == JobState::InProgress && is_past(event.updated_at, stale_after) {
                event.state = if event.attempt <= 0 {
                    JobState::Dead
                } else {
                    JobState::Failed
                };
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn active_events(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<ReplicationEvent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .values()
            .filter(|event| {
                matches!(
                    event.state,
                    JobState::Ready | JobState::InProgress | JobState::Failed
                ) && event.job.virtual_storage == virtual_storage
                    && event.job.relative_path == relative_path
            })
            .cloned()
            .collect())
    }
}

struct RepositoryRow {
    generation: i64,
    primary: Option<String>,
    primary_elected_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StoreInner {
    repositories: HashMap<(String, String), RepositoryRow>,
    /// `(virtual_storage, relative_path)` → storage → generation.
    replicas: HashMap<(String, String), BTreeMap<String, i64>>,
    assignments: HashMap<(String, String), BTreeSet<String>>,
}

/// Process-local [crate::RepositoryStore].
#[derive(Clone)]
pub struct MemoryRepositoryStore {
    inner: Arc<Mutex<StoreInner>>,
    configured: HashMap<String, Vec<String>>,
}

impl MemoryRepositoryStore {
    /// `configured` maps each virtual storage to its physical storages; the
    /// set doubles as the implicit assignment of repositories without
    /// explicit assignment rows.
    pub fn new(configured: HashMap<String, Vec<String>>) -> Self {
        Self {
            inner: Default::default(),
            configured,
        }
    }

    fn key(virtual_storage: &str, relative_path: &str) -> (String, String) {
        (virtual_storage.to_string(), relative_path.to_string())
    }

    fn not_found(virtual_storage: &str, relative_path: &str) -> DatastoreError {
        DatastoreError::RepositoryNotFound {
            virtual_storage: virtual_storage.to_string(),
            relative_path: relative_path.to_string(),
        }
    }

    fn assignments_of(
        &self,
        inner: &StoreInner,
        key: &(String, String),
    ) -> BTreeSet<String> {
        match inner.assignments.get(key) {
            Some(explicit) if !explicit.is_empty() => explicit.clone(),
            _ => self
                .configured
                .get(&key.0)
                .map(|storages| storages.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    fn metadata_locked(
        &self,
        inner: &StoreInner,
        key: &(String, String),
    ) -> Option<RepositoryInfo> {
        let row = inner.repositories.get(key)?;
        let assigned = self.assignments_of(inner, key);
        let replicas = inner.replicas.get(key).cloned().unwrap_or_default();

        let mut storages: BTreeSet<String> = replicas.keys().cloned().collect();
        storages.extend(assigned.iter().cloned());

        Some(RepositoryInfo {
            virtual_storage: key.0.clone(),
            relative_path: key.1.clone(),
            generation: row.generation,
            primary: row.primary.clone(),
            replicas: storages
                .into_iter()
                .map(|storage| ReplicaRecord {
                    generation: replicas.get(&storage).copied().unwrap_or(GENERATION_UNKNOWN),
                    assigned: assigned.contains(&storage),
                    storage,
                })
                .collect(),
        })
    }
}

#[async_trait::async_trait]
impl crate::RepositoryStore for MemoryRepositoryStore {
    async fn create_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        updated_secondaries: &[String],
        outdated_secondaries: &[String],
        store_primary: bool,
        store_assignments: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(virtual_storage, relative_path);

        if inner.repositories.contains_key(&key) {
            return Err(DatastoreError::AlreadyExists);
        }

        inner.repositories.insert(
            key.clone(),
            RepositoryRow {
                generation: 0,
                primary: store_primary.then(|| primary.to_string()),
                primary_elected_at: store_primary.then(Utc::now),
            },
        );

        let replicas = inner.replicas.entry(key.clone()).or_default();
        replicas.insert(primary.to_string(), 0);
        for storage in updated_secondaries {
            replicas.insert(storage.clone(), 0);
        }
        for storage in outdated_secondaries {
            replicas.insert(storage.clone(), GENERATION_UNKNOWN);
        }

        if store_assignments {
            let assigned = inner.assignments.entry(key).or_default();
            assigned.insert(primary.to_string());
            assigned.extend(updated_secondaries.iter().cloned());
            assigned.extend(outdated_secondaries.iter().cloned());
        }
        Ok(())
    }

    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(virtual_storage, relative_path);
        inner
            .replicas
            .entry(key.clone())
            .or_default()
            .insert(storage.to_string(), generation);

        // The repository record tracks the highest generation ever written.
        if let Some(row) = inner.repositories.get_mut(&key) {
            row.generation = row.generation.max(generation);
        }
        Ok(())
    }

    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        secondaries: &[String],
    ) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(virtual_storage, relative_path);

        let old = inner
            .repositories
            .get(&key)
            .ok_or_else(|| Self::not_found(virtual_storage, relative_path))?
            .generation;

        let replicas = inner.replicas.entry(key.clone()).or_default();
        if replicas.get(primary).copied().unwrap_or(GENERATION_UNKNOWN) != old {
            return Err(DatastoreError::WriteToOutdated);
        }

        let new = old + 1;
        replicas.insert(primary.to_string(), new);
        for storage in secondaries {
            if replicas.get(storage).copied() == Some(old) {
                replicas.insert(storage.clone(), new);
            }
        }
        inner.repositories.get_mut(&key).unwrap().generation = new;
        Ok(new)
    }

    async fn get_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .replicas
            .get(&Self::key(virtual_storage, relative_path))
            .and_then(|replicas| replicas.get(storage))
            .copied()
            .unwrap_or(GENERATION_UNKNOWN))
    }

    async fn get_replicated_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        source: &str,
        target: &str,
    ) -> Result<i64> {
        let (source_generation, target_generation) = {
            let inner = self.inner.lock().unwrap();
            let replicas = inner
                .replicas
                .get(&Self::key(virtual_storage, relative_path))
                .cloned()
                .unwrap_or_default();
            (
                replicas.get(source).copied().unwrap_or(GENERATION_UNKNOWN),
                replicas.get(target).copied().unwrap_or(GENERATION_UNKNOWN),
            )
        };

        if target_generation <= source_generation {
            Ok(source_generation)
        } else {
            Err(DatastoreError::DowngradeAttempted {
                storage: target.to_string(),
                current: target_generation,
                attempted: source_generation,
            })
        }
    }

    async fn get_consistent_storages(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<BTreeSet<String>> {
        let inner = self.inner.lock().unwrap();
        let key = Self::key(virtual_storage, relative_path);

        if !inner.repositories.contains_key(&key) {
            return Err(Self::not_found(virtual_storage, relative_path));
        }

        let replicas = inner.replicas.get(&key).cloned().unwrap_or_default();
        let max = replicas.values().copied().max().unwrap_or(GENERATION_UNKNOWN);
        Ok(replicas
            .into_iter()
            .filter(|(_, generation)| *generation == max && *generation != GENERATION_UNKNOWN)
            .map(|(storage, _)| storage)
            .collect())
    }

    async fn repository_exists(&self, virtual_storage: &str, relative_path: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .repositories
            .contains_key(&Self::key(virtual_storage, relative_path)))
    }

    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storages: &[String],
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(virtual_storage, relative_path);

        if inner.repositories.remove(&key).is_none() {
            return Err(Self::not_found(virtual_storage, relative_path));
        }
        inner.assignments.remove(&key);

        if let Some(replicas) = inner.replicas.get_mut(&key) {
            for storage in storages {
                replicas.remove(storage);
            }
            if replicas.is_empty() {
                inner.replicas.remove(&key);
            }
        }
        Ok(())
    }

    async fn delete_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner
            .replicas
            .get_mut(&Self::key(virtual_storage, relative_path))
            .and_then(|replicas| replicas.remove(storage));
        match removed {
            Some(_) => Ok(()),
            None => Err(DatastoreError::NoRowsAffected),
        }
    }

    async fn rename_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        new_relative_path: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let old_key = Self::key(virtual_storage, relative_path);
        let new_key = Self::key(virtual_storage, new_relative_path);

        if inner.repositories.contains_key(&new_key) {
            return Err(DatastoreError::AlreadyExists);
        }
        let Some(row) = inner.repositories.remove(&old_key) else {
            return Err(Self::not_found(virtual_storage, relative_path));
        };
        inner.repositories.insert(new_key.clone(), row);
        if let Some(replicas) = inner.replicas.remove(&old_key) {
            inner.replicas.insert(new_key.clone(), replicas);
        }
        if let Some(assigned) = inner.assignments.remove(&old_key) {
            inner.assignments.insert(new_key, assigned);
        }
        Ok(())
    }

    async fn set_authoritative_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(virtual_storage, relative_path);

        let row = inner
            .repositories
            .get_mut(&key)
            .ok_or_else(|| Self::not_found(virtual_storage, relative_path))?;
        row.generation += 1;
        let generation = row.generation;

        inner
            .replicas
            .entry(key)
            .or_default()
            .insert(storage.to_string(), generation);
        Ok(())
    }

    async fn get_partially_available_repositories(
        &self,
        virtual_storage: &str,
    ) -> Result<Vec<RepositoryInfo>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<RepositoryInfo> = inner
            .repositories
            .keys()
            .filter(|key| key.0 == virtual_storage)
            .filter_map(|key| self.metadata_locked(&inner, key))
            .filter(RepositoryInfo::is_partially_available)
            .collect();
        out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(out)
    }

    async fn list_repositories(&self, virtual_storage: &str) -> Result<Vec<RepositoryInfo>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<RepositoryInfo> = inner
            .repositories
            .keys()
            .filter(|key| key.0 == virtual_storage)
            .filter_map(|key| self.metadata_locked(&inner, key))
            .collect();
        out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(out)
    }

    async fn orphaned_replicas(&self, virtual_storage: &str) -> Result<Vec<(String, String)>> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for (key, replicas) in &inner.replicas {
            if key.0 != virtual_storage || inner.repositories.contains_key(key) {
                continue;
            }
            for storage in replicas.keys() {
                out.push((key.1.clone(), storage.clone()));
            }
        }
        out.sort();
        Ok(out)
    }

    async fn repository_metadata(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryInfo> {
        let inner = self.inner.lock().unwrap();
        self.metadata_locked(&inner, &Self::key(virtual_storage, relative_path))
            .ok_or_else(|| Self::not_found(virtual_storage, relative_path))
    }

    async fn get_host_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(self
            .assignments_of(&inner, &Self::key(virtual_storage, relative_path))
            .into_iter()
            .collect())
    }

    async fn set_replication_factor(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        replication_factor: usize,
    ) -> Result<Vec<String>> {
        let configured = self.configured.get(virtual_storage).cloned().unwrap_or_default();
        if replication_factor < 1 || replication_factor > configured.len() {
            return Err(DatastoreError::InvalidArgument(format!(
                "replication factor must be between 1 and {}, got {}",
                configured.len(),
                replication_factor
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(virtual_storage, relative_path);
        let primary = inner
            .repositories
            .get(&key)
            .ok_or_else(|| Self::not_found(virtual_storage, relative_path))?
            .primary
            .clone();

        let mut assigned = self.assignments_of(&inner, &key);
        let mut rng = rand::thread_rng();

        while assigned.len() > replication_factor {
            let removable: Vec<String> = assigned
                .iter()
                .filter(|storage| Some(storage.as_str()) != primary.as_deref())
                .cloned()
                .collect();
            match removable.choose(&mut rng) {
                Some(storage) => assigned.remove(storage),
                None => break,
            };
        }
        while assigned.len() < replication_factor {
            let candidates: Vec<String> = configured
                .iter()
                .filter(|storage| !assigned.contains(*storage))
                .cloned()
                .collect();
            match candidates.choose(&mut rng) {
                Some(storage) => assigned.insert(storage.clone()),
                None => break,
            };
        }

        inner.assignments.insert(key, assigned.clone());
        Ok(assigned.into_iter().collect())
    }

    async fn get_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<PrimaryRecord> {
        let inner = self.inner.lock().unwrap();
        let row = inner
            .repositories
            .get(&Self::key(virtual_storage, relative_path))
            .ok_or_else(|| Self::not_found(virtual_storage, relative_path))?;
        Ok(PrimaryRecord {
            storage: row.primary.clone(),
            elected_at: row.primary_elected_at,
        })
    }

    async fn elect_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        candidate: &str,
        failover_timeout: Duration,
    ) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .repositories
            .get_mut(&Self::key(virtual_storage, relative_path))
            .ok_or_else(|| Self::not_found(virtual_storage, relative_path))?;

        match &row.primary {
            Some(incumbent)
                if incumbent != candidate && !is_past(row.primary_elected_at, failover_timeout) =>
            {
                Ok(incumbent.clone())
            }
            _ => {
                row.primary = Some(candidate.to_string());
                row.primary_elected_at = Some(Utc::now());
                Ok(candidate.to_string())
            }
        }
    }

    async fn storage_lag(&self, virtual_storage: &str) -> Result<HashMap<String, i64>> {
        let inner = self.inner.lock().unwrap();
        let storages = self.configured.get(virtual_storage).cloned().unwrap_or_default();
        let mut lag: HashMap<String, i64> =
            storages.iter().map(|storage| (storage.clone(), 0)).collect();

        for (key, row) in &inner.repositories {
            if key.0 != virtual_storage {
                continue;
            }
            let replicas = inner.replicas.get(key);
            for storage in &storages {
                let generation = replicas
                    .and_then(|replicas| replicas.get(storage))
                    .copied()
                    .unwrap_or(GENERATION_UNKNOWN);
                *lag.get_mut(storage).unwrap() += row.generation - generation;
            }
        }
        Ok(lag)
    }
}

#[derive(Debug, Clone, Default)]
struct NodeStatus {
    last_contact_attempt_at: Option<DateTime<Utc>>,
    last_seen_active_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct NodeInner {
    /// `(proxy_name, virtual_storage, storage)` observations.
    statuses: HashMap<(String, String, String), NodeStatus>,
    shard_primaries: HashMap<String, ShardPrimary>,
}

/// Process-local [crate::NodeStatusStore] and [crate::ShardPrimaryStore].
#[derive(Clone, Default)]
pub struct MemoryNodeStore {
    inner: Arc<Mutex<NodeInner>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl crate::NodeStatusStore for MemoryNodeStore {
    async fn update_status(
        &self,
        proxy_name: &str,
        virtual_storage: &str,
        storage: &str,
        active: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let status = inner
            .statuses
            .entry((
                proxy_name.to_string(),
                virtual_storage.to_string(),
                storage.to_string(),
            ))
            .or_default();
        let now = Utc::now();
        status.last_contact_attempt_at = Some(now);
        if active {
            status.last_seen_active_at = Some(now);
        }
        Ok(())
    }

    async fn healthy_storages(
        &self,
        health_window: Duration,
        activity_window: Duration,
    ) -> Result<HashMap<String, BTreeSet<String>>> {
        let inner = self.inner.lock().unwrap();

        let active_instances: BTreeSet<&String> = inner
            .statuses
            .iter()
            .filter(|(_, status)| !is_past(status.last_contact_attempt_at, activity_window))
            .map(|((proxy, _, _), _)| proxy)
            .collect();
        let quorum = (active_instances.len() + 1) / 2;
        if quorum == 0 {
            return Ok(HashMap::new());
        }

        let mut votes: HashMap<(String, String), usize> = HashMap::new();
        for ((proxy, virtual_storage, storage), status) in &inner.statuses {
            if active_instances.contains(proxy) && !is_past(status.last_seen_active_at, health_window)
            {
                *votes
                    .entry((virtual_storage.clone(), storage.clone()))
                    .or_default() += 1;
            }
        }

        let mut healthy: HashMap<String, BTreeSet<String>> = HashMap::new();
        for ((virtual_storage, storage), count) in votes {
            if count >= quorum {
                healthy.entry(virtual_storage).or_default().insert(storage);
            }
        }
        Ok(healthy)
    }
}

#[async_trait::async_trait]
impl crate::ShardPrimaryStore for MemoryNodeStore {
    async fn get_shard_primary(&self, virtual_storage: &str) -> Result<Option<ShardPrimary>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.shard_primaries.get(virtual_storage).cloned())
    }

    async fn elect_shard_primary(
        &self,
        virtual_storage: &str,
        node: &str,
        elected_by: &str,
        failover_timeout: Duration,
    ) -> Result<ShardPrimary> {
        let mut inner = self.inner.lock().unwrap();

        let elected = match inner.shard_primaries.get(virtual_storage) {
            Some(incumbent)
                if incumbent.node != node && !is_past(Some(incumbent.elected_at), failover_timeout) =>
            {
                incumbent.clone()
            }
            Some(incumbent) if incumbent.node != node => ShardPrimary {
                node: node.to_string(),
                elected_by: elected_by.to_string(),
                elected_at: Utc::now(),
                demoted: true,
                previous_writable_primary: if incumbent.demoted {
                    incumbent.previous_writable_primary.clone()
                } else {
                    Some(incumbent.node.clone())
                },
            },
            Some(incumbent) => ShardPrimary {
                elected_at: Utc::now(),
                ..incumbent.clone()
            },
            None => ShardPrimary {
                node: node.to_string(),
                elected_by: elected_by.to_string(),
                elected_at: Utc::now(),
                demoted: false,
                previous_writable_primary: None,
            },
        };

        inner
            .shard_primaries
            .insert(virtual_storage.to_string(), elected.clone());
        Ok(elected)
    }

    async fn clear_demotion(&self, virtual_storage: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.shard_primaries.get_mut(virtual_storage) {
            Some(primary) => {
                primary.demoted = false;
                primary.previous_writable_primary = None;
                Ok(())
            }
            None => Err(DatastoreError::NoRowsAffected),
        }
    }
}
