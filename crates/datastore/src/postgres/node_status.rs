use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::PgNodeStore;
use crate::types::ShardPrimary;
use crate::{DatastoreError, Result};

fn cutoff(window: Duration) -> Result<DateTime<Utc>> {
    Ok(Utc::now()
        - chrono::Duration::from_std(window)
            .map_err(|err| DatastoreError::InvalidArgument(err.to_string()))?)
}

#[async_trait::async_trait]
impl crate::NodeStatusStore for PgNodeStore {
    async fn update_status(
        &self,
        proxy_name: &str,
        virtual_storage: &str,
        storage: &str,
        active: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_status
                 (proxy_name, virtual_storage, storage, last_contact_attempt_at, last_seen_active_at)
             VALUES ($1, $2, $3, now(), CASE WHEN $4 THEN now() END)
             ON CONFLICT (proxy_name, virtual_storage, storage)
             DO UPDATE SET
                 last_contact_attempt_at = now(),
                 last_seen_active_at = CASE
                     WHEN $4 THEN now()
                     ELSE node_status.last_seen_active_at
                 END",
        )
        .bind(proxy_name)
        .bind(virtual_storage)
        .bind(storage)
        .bind(active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn healthy_storages(
        &self,
        health_window: Duration,
        activity_window: Duration,
    ) -> Result<HashMap<String, BTreeSet<String>>> {
        let rows = sqlx::query(
            "WITH active AS (
                 SELECT DISTINCT proxy_name FROM node_status
                 WHERE last_contact_attempt_at >= $2
             )
             SELECT virtual_storage, storage
             FROM node_status
             JOIN active USING (proxy_name)
             WHERE last_seen_active_at >= $1
             GROUP BY virtual_storage, storage
             HAVING COUNT(DISTINCT proxy_name) >= (SELECT (COUNT(*) + 1) / 2 FROM active)",
        )
        .bind(cutoff(health_window)?)
        .bind(cutoff(activity_window)?)
        .fetch_all(&self.pool)
        .await?;

        let mut healthy: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in rows {
            healthy
                .entry(row.try_get("virtual_storage")?)
                .or_default()
                .insert(row.try_get("storage")?);
        }
        Ok(healthy)
    }
}

fn shard_primary_from_row(row: &sqlx::postgres::PgRow) -> Result<ShardPrimary> {
    Ok(ShardPrimary {
        node: row.try_get("node_name")?,
        elected_by: row.try_get("elected_by")?,
        elected_at: row.try_get("elected_at")?,
        demoted: row.try_get("demoted")?,
        previous_writable_primary: row.try_get("previous_writable_primary")?,
    })
}

#[async_trait::async_trait]
impl crate::ShardPrimaryStore for PgNodeStore {
    async fn get_shard_primary(&self, virtual_storage: &str) -> Result<Option<ShardPrimary>> {
        let row = sqlx::query(
            "SELECT node_name, elected_by, elected_at, demoted, previous_writable_primary
             FROM shard_primaries WHERE shard_name = $1",
        )
        .bind(virtual_storage)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(shard_primary_from_row).transpose()
    }

    async fn elect_shard_primary(
        &self,
        virtual_storage: &str,
        node: &str,
        elected_by: &str,
        failover_timeout: Duration,
    ) -> Result<ShardPrimary> {
        let mut tx = self.pool.begin().await?;

        let incumbent = sqlx::query(
            "SELECT node_name, elected_by, elected_at, demoted, previous_writable_primary
             FROM shard_primaries WHERE shard_name = $1
             FOR UPDATE",
        )
        .bind(virtual_storage)
        .fetch_optional(&mut tx)
        .await?
        .as_ref()
        .map(shard_primary_from_row)
        .transpose()?;

        let elected = match incumbent {
            Some(incumbent) if incumbent.node != node => {
                if Utc::now().signed_duration_since(incumbent.elected_at)
                    <= chrono::Duration::from_std(failover_timeout)
                        .map_err(|err| DatastoreError::InvalidArgument(err.to_string()))?
                {
                    tx.rollback().await?;
                    return Ok(incumbent);
                }
                // Failover: the shard goes read-only until the demotion is
                // cleared by the operator.
                ShardPrimary {
                    node: node.to_string(),
                    elected_by: elected_by.to_string(),
                    elected_at: Utc::now(),
                    demoted: true,
                    previous_writable_primary: if incumbent.demoted {
                        incumbent.previous_writable_primary
                    } else {
                        Some(incumbent.node)
                    },
                }
            }
            Some(incumbent) => ShardPrimary {
                elected_at: Utc::now(),
                ..incumbent
            },
            None => ShardPrimary {
                node: node.to_string(),
                elected_by: elected_by.to_string(),
                elected_at: Utc::now(),
                demoted: false,
                previous_writable_primary: None,
            },
        };

        sqlx::query(
            "INSERT INTO shard_primaries
                 (shard_name, node_name, elected_by, elected_at, demoted, previous_writable_primary)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (shard_name) DO UPDATE SET
                 node_name = EXCLUDED.node_name,
                 elected_by = EXCLUDED.elected_by,
                 elected_at = EXCLUDED.elected_at,
                 demoted = EXCLUDED.demoted,
                 previous_writable_primary = EXCLUDED.previous_writable_primary",
        )
        .bind(virtual_storage)
        .bind(&elected.node)
        .bind(&elected.elected_by)
        .bind(elected.elected_at)
        .bind(elected.demoted)
        .bind(&elected.previous_writable_primary)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(elected)
    }

    async fn clear_demotion(&self, virtual_storage: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE shard_primaries
             SET demoted = FALSE, previous_writable_primary = NULL
             WHERE shard_name = $1",
        )
        .bind(virtual_storage)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(DatastoreError::NoRowsAffected);
        }
        Ok(())
    }
}
