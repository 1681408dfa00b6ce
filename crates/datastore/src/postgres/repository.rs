use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use super::PgRepositoryStore;
use crate::types::*;
use crate::{DatastoreError, Result};

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

struct RepositoryRow {
    relative_path: String,
    generation: i64,
    primary: Option<String>,
}

fn repository_from_row(row: &PgRow) -> Result<RepositoryRow> {
    Ok(RepositoryRow {
        relative_path: row.try_get("relative_path")?,
        generation: row.try_get("generation")?,
        primary: row.try_get("primary")?,
    })
}

impl PgRepositoryStore {
    fn not_found(virtual_storage: &str, relative_path: &str) -> DatastoreError {
        DatastoreError::RepositoryNotFound {
            virtual_storage: virtual_storage.to_string(),
            relative_path: relative_path.to_string(),
        }
    }

    fn configured_storages(&self, virtual_storage: &str) -> Vec<String> {
        self.configured
            .get(virtual_storage)
            .cloned()
            .unwrap_or_default()
    }

    /// Assembles [RepositoryInfo] rows for either one repository or a whole
    /// virtual storage, from a single consistent snapshot.
    async fn assemble_metadata(
        &self,
        virtual_storage: &str,
        relative_path: Option<&str>,
    ) -> Result<Vec<RepositoryInfo>> {
        let mut tx = self.pool.begin().await?;

        let repositories = sqlx::query(
            r#"SELECT relative_path, generation, "primary"
               FROM repositories
               WHERE virtual_storage = $1 AND ($2::text IS NULL OR relative_path = $2)
               ORDER BY relative_path"#,
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&mut tx)
        .await?;

        let replicas = sqlx::query(
            "SELECT relative_path, storage, generation
             FROM storage_repositories
             WHERE virtual_storage = $1 AND ($2::text IS NULL OR relative_path = $2)",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&mut tx)
        .await?;

        let assignments = sqlx::query(
            "SELECT relative_path, storage
             FROM repository_assignments
             WHERE virtual_storage = $1 AND ($2::text IS NULL OR relative_path = $2)",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&mut tx)
        .await?;

        tx.commit().await?;

        let mut replica_map: HashMap<String, BTreeMap<String, i64>> = HashMap::new();
        for row in &replicas {
            replica_map
                .entry(row.try_get("relative_path")?)
                .or_default()
                .insert(row.try_get("storage")?, row.try_get("generation")?);
        }
        let mut assignment_map: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in &assignments {
            assignment_map
                .entry(row.try_get("relative_path")?)
                .or_default()
                .insert(row.try_get("storage")?);
        }

        let configured: BTreeSet<String> =
            self.configured_storages(virtual_storage).into_iter().collect();

        repositories
            .iter()
            .map(|row| {
                let repository = repository_from_row(row)?;
                let replicas = replica_map
                    .remove(&repository.relative_path)
                    .unwrap_or_default();
                let assigned = match assignment_map.remove(&repository.relative_path) {
                    Some(explicit) if !explicit.is_empty() => explicit,
                    _ => configured.clone(),
                };

                let mut storages: BTreeSet<String> = replicas.keys().cloned().collect();
                storages.extend(assigned.iter().cloned());

                Ok(RepositoryInfo {
                    virtual_storage: virtual_storage.to_string(),
                    relative_path: repository.relative_path.clone(),
                    generation: repository.generation,
                    primary: repository.primary,
                    replicas: storages
                        .into_iter()
                        .map(|storage| ReplicaRecord {
                            generation: replicas
                                .get(&storage)
                                .copied()
                                .unwrap_or(GENERATION_UNKNOWN),
                            assigned: assigned.contains(&storage),
                            storage,
                        })
                        .collect(),
                })
            })
            .collect()
    }
}

async fn upsert_replicas(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    virtual_storage: &str,
    relative_path: &str,
    storages: &[String],
    generation: i64,
) -> Result<()> {
    if storages.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO storage_repositories (virtual_storage, relative_path, storage, generation)
         SELECT $1, $2, unnest($3::text[]), $4
         ON CONFLICT (virtual_storage, relative_path, storage)
         DO UPDATE SET generation = EXCLUDED.generation",
    )
    .bind(virtual_storage)
    .bind(relative_path)
    .bind(storages)
    .bind(generation)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl crate::RepositoryStore for PgRepositoryStore {
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
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query(
            r#"INSERT INTO repositories
                   (virtual_storage, relative_path, generation, "primary", primary_elected_at)
               VALUES ($1, $2, 0,
                       CASE WHEN $4 THEN $3 END,
                       CASE WHEN $4 THEN now() END)
               ON CONFLICT (virtual_storage, relative_path) DO NOTHING"#,
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(primary)
        .bind(store_primary)
        .execute(&mut tx)
        .await?
        .rows_affected();
        if created == 0 {
            return Err(DatastoreError::AlreadyExists);
        }

        let mut updated = vec![primary.to_string()];
        updated.extend(updated_secondaries.iter().cloned());
        upsert_replicas(&mut tx, virtual_storage, relative_path, &updated, 0).await?;
        upsert_replicas(
            &mut tx,
            virtual_storage,
            relative_path,
            outdated_secondaries,
            GENERATION_UNKNOWN,
        )
        .await?;

        if store_assignments {
            let mut assigned = updated;
            assigned.extend(outdated_secondaries.iter().cloned());
            sqlx::query(
                "INSERT INTO repository_assignments (virtual_storage, relative_path, storage)
                 SELECT $1, $2, unnest($3::text[])
                 ON CONFLICT DO NOTHING",
            )
            .bind(virtual_storage)
            .bind(relative_path)
            .bind(&assigned)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        upsert_replicas(
            &mut tx,
            virtual_storage,
            relative_path,
            &[storage.to_string()],
            generation,
        )
        .await?;

        // The repository record tracks the highest generation ever written.
        sqlx::query(
            "UPDATE repositories
             SET generation = GREATEST(generation, $3)
             WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(generation)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        secondaries: &[String],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let repository = sqlx::query(
            "SELECT generation FROM repositories
             WHERE virtual_storage = $1 AND relative_path = $2
             FOR UPDATE",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_optional(&mut tx)
        .await?;
        let old: i64 = match repository {
            Some(row) => row.try_get("generation")?,
            None => return Err(Self::not_found(virtual_storage, relative_path)),
        };

        let primary_generation: Option<(i64,)> = sqlx::query_as(
            "SELECT generation FROM storage_repositories
             WHERE virtual_storage = $1 AND relative_path = $2 AND storage = $3",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(primary)
        .fetch_optional(&mut tx)
        .await?;
        if primary_generation.map(|(generation,)| generation) != Some(old) {
            return Err(DatastoreError::WriteToOutdated);
        }

        let new = old + 1;
        sqlx::query(
            "UPDATE repositories SET generation = $3
             WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(new)
        .execute(&mut tx)
        .await?;

        sqlx::query(
            "UPDATE storage_repositories
             SET generation = $3
             WHERE virtual_storage = $1 AND relative_path = $2
               AND (storage = $4 OR (storage = ANY($5) AND generation = $6))",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(new)
        .bind(primary)
        .bind(secondaries)
        .bind(old)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(new)
    }

    async fn get_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<i64> {
        let generation: Option<(i64,)> = sqlx::query_as(
            "SELECT generation FROM storage_repositories
             WHERE virtual_storage = $1 AND relative_path = $2 AND storage = $3",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(storage)
        .fetch_optional(&self.pool)
        .await?;
        Ok(generation.map(|(g,)| g).unwrap_or(GENERATION_UNKNOWN))
    }

    async fn get_replicated_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        source: &str,
        target: &str,
    ) -> Result<i64> {
        let source_generation = self
            .get_generation(virtual_storage, relative_path, source)
            .await?;
        let target_generation = self
            .get_generation(virtual_storage, relative_path, target)
            .await?;

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
        if let Some(cache) = &self.cache {
            if let Some(storages) = cache.get(virtual_storage, relative_path) {
                return Ok(storages);
            }
        }

        let exists = self
            .repository_exists(virtual_storage, relative_path)
            .await?;
        if !exists {
            return Err(Self::not_found(virtual_storage, relative_path));
        }

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT storage FROM storage_repositories
             WHERE virtual_storage = $1 AND relative_path = $2 AND generation >= 0
               AND generation = (
                   SELECT MAX(generation) FROM storage_repositories
                   WHERE virtual_storage = $1 AND relative_path = $2
               )",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&self.pool)
        .await?;

        let storages: BTreeSet<String> = rows.into_iter().map(|(storage,)| storage).collect();
        if let Some(cache) = &self.cache {
            cache.insert(virtual_storage, relative_path, storages.clone());
        }
        Ok(storages)
    }

    async fn repository_exists(&self, virtual_storage: &str, relative_path: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                SELECT 1 FROM repositories
                WHERE virtual_storage = $1 AND relative_path = $2
            )",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storages: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM repositories WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .execute(&mut tx)
        .await?
        .rows_affected();
        if deleted == 0 {
            return Err(Self::not_found(virtual_storage, relative_path));
        }

        sqlx::query(
            "DELETE FROM storage_repositories
             WHERE virtual_storage = $1 AND relative_path = $2 AND storage = ANY($3)",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(storages)
        .execute(&mut tx)
        .await?;

        sqlx::query(
            "DELETE FROM repository_assignments
             WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<()> {
        let deleted = sqlx::query(
            "DELETE FROM storage_repositories
             WHERE virtual_storage = $1 AND relative_path = $2 AND storage = $3",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(storage)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if deleted == 0 {
            return Err(DatastoreError::NoRowsAffected);
        }
        Ok(())
    }

    async fn rename_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        new_relative_path: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let renamed = sqlx::query(
            "UPDATE repositories SET relative_path = $3
             WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(new_relative_path)
        .execute(&mut tx)
        .await
        .map_err(|err| {
            if unique_violation(&err) {
                DatastoreError::AlreadyExists
            } else {
                err.into()
            }
        })?
        .rows_affected();
        if renamed == 0 {
            return Err(Self::not_found(virtual_storage, relative_path));
        }

        for table in ["storage_repositories", "repository_assignments"] {
            sqlx::query(&format!(
                "UPDATE {table} SET relative_path = $3
                 WHERE virtual_storage = $1 AND relative_path = $2"
            ))
            .bind(virtual_storage)
            .bind(relative_path)
            .bind(new_relative_path)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_authoritative_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let generation: Option<(i64,)> = sqlx::query_as(
            "UPDATE repositories SET generation = generation + 1
             WHERE virtual_storage = $1 AND relative_path = $2
             RETURNING generation",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_optional(&mut tx)
        .await?;
        let Some((generation,)) = generation else {
            return Err(Self::not_found(virtual_storage, relative_path));
        };

        upsert_replicas(
            &mut tx,
            virtual_storage,
            relative_path,
            &[storage.to_string()],
            generation,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_partially_available_repositories(
        &self,
        virtual_storage: &str,
    ) -> Result<Vec<RepositoryInfo>> {
        let all = self.assemble_metadata(virtual_storage, None).await?;
        Ok(all
            .into_iter()
            .filter(RepositoryInfo::is_partially_available)
            .collect())
    }

    async fn list_repositories(&self, virtual_storage: &str) -> Result<Vec<RepositoryInfo>> {
        self.assemble_metadata(virtual_storage, None).await
    }

    async fn orphaned_replicas(&self, virtual_storage: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT sr.relative_path, sr.storage
             FROM storage_repositories AS sr
             LEFT JOIN repositories AS r
               ON r.virtual_storage = sr.virtual_storage
              AND r.relative_path = sr.relative_path
             WHERE sr.virtual_storage = $1 AND r.relative_path IS NULL
             ORDER BY sr.relative_path, sr.storage",
        )
        .bind(virtual_storage)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn repository_metadata(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryInfo> {
        self.assemble_metadata(virtual_storage, Some(relative_path))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Self::not_found(virtual_storage, relative_path))
    }

    async fn get_host_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT storage FROM repository_assignments
             WHERE virtual_storage = $1 AND relative_path = $2
             ORDER BY storage",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            let mut configured = self.configured_storages(virtual_storage);
            configured.sort();
            return Ok(configured);
        }
        Ok(rows.into_iter().map(|(storage,)| storage).collect())
    }

    async fn set_replication_factor(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        replication_factor: usize,
    ) -> Result<Vec<String>> {
        use rand::seq::SliceRandom;

        let configured = self.configured_storages(virtual_storage);
        if replication_factor < 1 || replication_factor > configured.len() {
            return Err(DatastoreError::InvalidArgument(format!(
                "replication factor must be between 1 and {}, got {}",
                configured.len(),
                replication_factor
            )));
        }

        let mut tx = self.pool.begin().await?;

        let primary: Option<(Option<String>,)> = sqlx::query_as(
            r#"SELECT "primary" FROM repositories
               WHERE virtual_storage = $1 AND relative_path = $2
               FOR UPDATE"#,
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_optional(&mut tx)
        .await?;
        let Some((primary,)) = primary else {
            return Err(Self::not_found(virtual_storage, relative_path));
        };

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT storage FROM repository_assignments
             WHERE virtual_storage = $1 AND relative_path = $2
             FOR UPDATE",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&mut tx)
        .await?;

        let mut assigned: BTreeSet<String> = if rows.is_empty() {
            configured.iter().cloned().collect()
        } else {
            rows.into_iter().map(|(storage,)| storage).collect()
        };

        {
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
        }

        sqlx::query(
            "DELETE FROM repository_assignments
             WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .execute(&mut tx)
        .await?;
        let assigned: Vec<String> = assigned.into_iter().collect();
        sqlx::query(
            "INSERT INTO repository_assignments (virtual_storage, relative_path, storage)
             SELECT $1, $2, unnest($3::text[])",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(&assigned)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(assigned)
    }

    async fn get_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<PrimaryRecord> {
        let row: Option<(Option<String>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"SELECT "primary", primary_elected_at FROM repositories
               WHERE virtual_storage = $1 AND relative_path = $2"#,
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((storage, elected_at)) => Ok(PrimaryRecord {
                storage,
                elected_at,
            }),
            None => Err(Self::not_found(virtual_storage, relative_path)),
        }
    }

    async fn elect_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        candidate: &str,
        failover_timeout: Duration,
    ) -> Result<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(failover_timeout)
                .map_err(|err| DatastoreError::InvalidArgument(err.to_string()))?;

        let elected: Option<(Option<String>,)> = sqlx::query_as(
            r#"UPDATE repositories
               SET "primary" = $3, primary_elected_at = now()
               WHERE virtual_storage = $1 AND relative_path = $2
                 AND ("primary" IS NULL
                      OR "primary" = $3
                      OR primary_elected_at IS NULL
                      OR primary_elected_at < $4)
               RETURNING "primary""#,
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(candidate)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((Some(primary),)) = elected {
            return Ok(primary);
        }

        // A competitor won, or the incumbent is still fresh.
        self.get_primary(virtual_storage, relative_path)
            .await?
            .storage
            .ok_or(DatastoreError::NoRowsAffected)
    }

    async fn storage_lag(&self, virtual_storage: &str) -> Result<HashMap<String, i64>> {
        let configured = self.configured_storages(virtual_storage);

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT candidates.storage, COALESCE(SUM(r.generation - COALESCE(sr.generation, -1)), 0)::bigint
             FROM repositories AS r
             CROSS JOIN unnest($2::text[]) AS candidates(storage)
             LEFT JOIN storage_repositories AS sr
               ON sr.virtual_storage = r.virtual_storage
              AND sr.relative_path = r.relative_path
              AND sr.storage = candidates.storage
             WHERE r.virtual_storage = $1
             GROUP BY candidates.storage",
        )
        .bind(virtual_storage)
        .bind(&configured)
        .fetch_all(&self.pool)
        .await?;

        let mut lag: HashMap<String, i64> = configured
            .into_iter()
            .map(|storage| (storage, 0))
            .collect();
        for (storage, total) in rows {
            lag.insert(storage, total);
        }
        Ok(lag)
    }
}
