//! Ordered schema migrations, applied by `palisaded apply-schema` and
//! reported by `palisaded schema-status`.

use sqlx::{Executor, PgPool};

pub struct Migration {
    pub id: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_initial",
        sql: r#"
CREATE TABLE repositories (
    virtual_storage TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    generation BIGINT NOT NULL DEFAULT 0,
    "primary" TEXT,
    primary_elected_at TIMESTAMPTZ,
    PRIMARY KEY (virtual_storage, relative_path)
);

CREATE TABLE storage_repositories (
    virtual_storage TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    storage TEXT NOT NULL,
    generation BIGINT NOT NULL DEFAULT -1,
    PRIMARY KEY (virtual_storage, relative_path, storage)
);

CREATE TABLE repository_assignments (
    virtual_storage TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    storage TEXT NOT NULL,
    PRIMARY KEY (virtual_storage, relative_path, storage)
);

CREATE TABLE shard_primaries (
    shard_name TEXT PRIMARY KEY,
    node_name TEXT NOT NULL,
    elected_by TEXT NOT NULL,
    elected_at TIMESTAMPTZ NOT NULL,
    demoted BOOLEAN NOT NULL DEFAULT FALSE,
    previous_writable_primary TEXT
);

CREATE TABLE node_status (
    proxy_name TEXT NOT NULL,
    virtual_storage TEXT NOT NULL,
    storage TEXT NOT NULL,
    last_contact_attempt_at TIMESTAMPTZ,
    last_seen_active_at TIMESTAMPTZ,
    PRIMARY KEY (proxy_name, virtual_storage, storage)
);

CREATE TABLE replication_queue (
    id BIGSERIAL PRIMARY KEY,
    state TEXT NOT NULL DEFAULT 'ready',
    attempt INT NOT NULL DEFAULT 3,
    lock_id TEXT NOT NULL,
    job JSONB NOT NULL,
    meta JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ
);

CREATE INDEX replication_queue_lock_idx
    ON replication_queue (lock_id, state, updated_at);
CREATE INDEX replication_queue_target_idx
    ON replication_queue ((job->>'virtual_storage'), (job->>'target_storage'), state);
"#,
    },
    Migration {
        id: "0002_update_notifications",
        sql: r#"
CREATE FUNCTION notify_repository_updates() RETURNS TRIGGER AS $$
DECLARE
    affected RECORD;
BEGIN
    affected := COALESCE(NEW, OLD);
    PERFORM pg_notify(
        TG_ARGV[0],
        json_build_object(
            'virtual_storage', affected.virtual_storage,
            'relative_path', affected.relative_path
        )::text
    );
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER repositories_updates
    AFTER INSERT OR UPDATE OR DELETE ON repositories
    FOR EACH ROW EXECUTE FUNCTION notify_repository_updates('repositories_updates');

CREATE TRIGGER storage_repositories_updates
    AFTER INSERT OR UPDATE OR DELETE ON storage_repositories
    FOR EACH ROW EXECUTE FUNCTION notify_repository_updates('storage_repositories_updates');
"#,
    },
];

/// Creates the bookkeeping table on first use and applies every migration
/// not yet recorded, each in its own transaction. Returns the applied ids.
pub async fn apply(pool: &PgPool) -> crate::Result<Vec<&'static str>> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;

    let mut applied = Vec::new();
    for migration in MIGRATIONS {
        let mut tx = pool.begin().await?;

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM schema_migrations WHERE id = $1 FOR UPDATE")
                .bind(migration.id)
                .fetch_optional(&mut tx)
                .await?;
        if exists.is_some() {
            tx.rollback().await?;
            continue;
        }

        // Raw execution: migration scripts hold multiple statements, which
        // the prepared-statement path rejects.
        (&mut tx).execute(migration.sql).await?;
        sqlx::query("INSERT INTO schema_migrations (id) VALUES ($1)")
            .bind(migration.id)
            .execute(&mut tx)
            .await?;
        tx.commit().await?;

        tracing::info!(id = migration.id, "applied schema migration");
        applied.push(migration.id);
    }
    Ok(applied)
}

/// Per-migration application status.
pub async fn status(pool: &PgPool) -> crate::Result<Vec<(&'static str, bool)>> {
    let applied: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM schema_migrations",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    let applied: std::collections::HashSet<String> =
        applied.into_iter().map(|(id,)| id).collect();

    Ok(MIGRATIONS
        .iter()
        .map(|migration| (migration.id, applied.contains(migration.id)))
        .collect())
}

/// Round-trips the backend connection.
pub async fn ping(pool: &PgPool) -> crate::Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
