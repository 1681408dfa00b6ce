use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;

use super::PgQueue;
use crate::types::*;
use crate::{DatastoreError, Result};

const EVENT_COLUMNS: &str = "id, state, attempt, lock_id, job, created_at, updated_at";

fn event_from_row(row: &PgRow) -> Result<ReplicationEvent> {
    let state: String = row.try_get("state")?;
    let Json(job): Json<ReplicationJob> = row.try_get("job")?;
    Ok(ReplicationEvent {
        id: row.try_get("id")?,
        state: JobState::parse(&state).ok_or_else(|| {
            DatastoreError::InvalidArgument(format!("unknown replication event state {state:?}"))
        })?,
        attempt: row.try_get("attempt")?,
        lock_id: row.try_get("lock_id")?,
        job,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait::async_trait]
impl crate::ReplicationQueue for PgQueue {
    async fn enqueue(&self, job: ReplicationJob) -> Result<ReplicationEvent> {
        let row = sqlx::query(&format!(
            "INSERT INTO replication_queue (state, attempt, lock_id, job)
             VALUES ('ready', 3, $1, $2)
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(job.lock_id())
        .bind(Json(&job))
        .fetch_one(&self.pool)
        .await?;
        event_from_row(&row)
    }

    async fn dequeue(
        &self,
        virtual_storage: &str,
        target_storage: &str,
        count: usize,
    ) -> Result<Vec<ReplicationEvent>> {
        let mut tx = self.pool.begin().await?;

        // Dequeues for one target are serialized across proxy instances so
        // the in-progress check below cannot race another instance into
        // double-processing a lock_id.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || '|' || $2)::bigint)")
            .bind(virtual_storage)
            .bind(target_storage)
            .execute(&mut tx)
            .await?;

        let rows = sqlx::query(&format!(
            "WITH candidates AS (
                SELECT id, lock_id,
                       row_number() OVER (PARTITION BY lock_id ORDER BY id) AS per_lock_rank
                FROM replication_queue
                WHERE state IN ('ready', 'failed')
                  AND attempt > 0
                  AND job->>'virtual_storage' = $1
                  AND job->>'target_storage' = $2
                  AND lock_id NOT IN (
                      SELECT lock_id FROM replication_queue WHERE state = 'in_progress'
                  )
            ),
            picked AS (
                SELECT id FROM candidates
                WHERE per_lock_rank = 1
                ORDER BY id
                LIMIT $3
            )
            UPDATE replication_queue AS queue
            SET state = 'in_progress', attempt = queue.attempt - 1, updated_at = now()
            FROM picked
            WHERE queue.id = picked.id
            RETURNING {EVENT_COLUMNS}"
        ))
        .bind(virtual_storage)
        .bind(target_storage)
        .bind(count as i64)
        .fetch_all(&mut tx)
        .await?;

        tx.commit().await?;

        let mut events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>>>()?;
        events.sort_by_key(|event| event.id);
        Ok(events)
    }

    async fn acknowledge(&self, state: JobState, ids: &[i64]) -> Result<Vec<i64>> {
        if !state.is_acknowledgement() {
            return Err(DatastoreError::InvalidArgument(format!(
                "replication event cannot be acknowledged as {}",
                state.as_str()
            )));
        }

        let mut tx = self.pool.begin().await?;

        if state == JobState::Failed {
            let (exhausted,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM replication_queue
                 WHERE id = ANY($1) AND state = 'in_progress' AND attempt <= 0",
            )
            .bind(ids)
            .fetch_one(&mut tx)
            .await?;
            if exhausted > 0 {
                return Err(DatastoreError::AttemptsExhausted);
            }
        }

        let acked: Vec<(i64,)> = sqlx::query_as(
            "UPDATE replication_queue
             SET state = $1, updated_at = now()
             WHERE id = ANY($2) AND state = 'in_progress'
             RETURNING id",
        )
        .bind(state.as_str())
        .bind(ids)
        .fetch_all(&mut tx)
        .await?;
        let acked: Vec<i64> = acked.into_iter().map(|(id,)| id).collect();

        if state == JobState::Completed && !acked.is_empty() {
            // A completed update supersedes identical ready jobs which were
            // enqueued while it ran.
            sqlx::query(
                "DELETE FROM replication_queue AS stale
                 USING replication_queue AS completed
                 WHERE completed.id = ANY($1)
                   AND completed.job->>'change' = 'update'
                   AND stale.id <> completed.id
                   AND stale.state = 'ready'
                   AND stale.job = completed.job
                   AND stale.created_at < completed.updated_at",
            )
            .bind(&acked)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        Ok(acked)
    }

    async fn touch(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let touched: Vec<(i64,)> = sqlx::query_as(
            "UPDATE replication_queue
             SET updated_at = now()
             WHERE id = ANY($1) AND state = 'in_progress'
             RETURNING id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(touched.into_iter().map(|(id,)| id).collect())
    }

    async fn acknowledge_stale(&self, stale_after: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after)
                .map_err(|err| DatastoreError::InvalidArgument(err.to_string()))?;

        let swept = sqlx::query(
            "UPDATE replication_queue
             SET state = CASE WHEN attempt <= 0 THEN 'dead' ELSE 'failed' END
             WHERE state = 'in_progress'
               AND COALESCE(updated_at, created_at) < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(swept)
    }

    async fn active_events(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<ReplicationEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM replication_queue
             WHERE state IN ('ready', 'in_progress', 'failed')
               AND job->>'virtual_storage' = $1
               AND job->>'relative_path' = $2
             ORDER BY id"
        ))
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}
