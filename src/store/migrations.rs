//! Schema migrations for the queue database.
//!
//! Versions are applied in ascending order, each inside its own transaction
//! together with its `schema_migrations` row, so a crash mid-upgrade leaves
//! the schema at the last fully applied version.

use libsql::{Connection, TransactionBehavior};

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Existing versions are never edited once released.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "pipeline_entities",
        sql: r#"
            CREATE TABLE IF NOT EXISTS planners (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'received'
                    CHECK (status IN ('received', 'routed', 'planned', 'tasks_created',
                                      'workers_initialised', 'synthesised')),
                next_task TEXT,
                state TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                planner_id TEXT REFERENCES planners(id),
                kind TEXT NOT NULL CHECK (kind IN ('standard', 'structured_data')),
                task_status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (task_status IN ('pending', 'in_progress', 'completed',
                                           'failed_validation', 'recorded')),
                next_task TEXT,
                state TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workers_planner ON workers(planner_id);
        "#,
    },
    Migration {
        version: 2,
        name: "task_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS task_queue (
                task_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL CHECK (entity_type IN ('planner', 'worker')),
                entity_id TEXT NOT NULL,
                function_name TEXT NOT NULL,
                payload TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
                max_retries INTEGER NOT NULL DEFAULT 3 CHECK (max_retries >= 0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (retry_count <= max_retries),
                CHECK (status <> 'failed' OR error_message IS NOT NULL),
                CHECK (status <> 'completed' OR error_message IS NULL)
            );
            CREATE INDEX IF NOT EXISTS idx_task_queue_status_created
                ON task_queue(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_task_queue_entity
                ON task_queue(entity_type, entity_id, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_task_queue_one_in_progress
                ON task_queue(entity_type, entity_id) WHERE status = 'in_progress';
        "#,
    },
    Migration {
        version: 3,
        name: "task_queue_retry_after",
        sql: r#"
            ALTER TABLE task_queue ADD COLUMN retry_after TEXT;
        "#,
    },
];

/// Bring the schema up to the latest version. Safe to call on every start.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
        (),
    )
    .await
    .map_err(|e| migration_err("create schema_migrations", e))?;

    let applied = get_current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema is up to date");
        return Ok(());
    }

    for migration in pending {
        apply(conn, migration).await?;
    }

    let current = get_current_version(conn).await?;
    tracing::info!(from = applied, to = current, "Schema migrated");
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    tracing::info!(
        version = migration.version,
        name = migration.name,
        "Applying schema migration"
    );
    let label = format!("V{} {}", migration.version, migration.name);

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .await
        .map_err(|e| migration_err(&label, e))?;
    tx.execute_batch(migration.sql)
        .await
        .map_err(|e| migration_err(&label, e))?;
    tx.execute(
        "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(|e| migration_err(&label, e))?;
    tx.commit().await.map_err(|e| migration_err(&label, e))
}

/// Highest applied version; 0 on a fresh database.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT MAX(version) FROM schema_migrations", ())
        .await
        .map_err(|e| migration_err("read schema version", e))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| migration_err("read schema version", e))?
    else {
        return Ok(0);
    };
    match row.get_value(0) {
        Ok(libsql::Value::Integer(v)) => Ok(v),
        Ok(_) => Ok(0),
        Err(e) => Err(migration_err("read schema version", e)),
    }
}

fn migration_err(step: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{step}: {e}"))
}
