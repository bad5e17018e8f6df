//! libSQL backend: async `QueueStore` implementation.
//!
//! Supports local file and in-memory databases. All statements on the shared
//! connection run under one async mutex, so a multi-statement transaction is
//! never interleaved with another caller's statements.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, Value, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entity::{EntityRef, EntitySnapshot, EntityStatus, EntityType, PlannerRecord, WorkerRecord};
use crate::error::DatabaseError;
use crate::queue::{NewTask, QueueStats, TaskFunction, TaskQueueEntry, TaskStatus};
use crate::store::migrations;
use crate::store::traits::{CompletionCommit, FailureOutcome, PurgeCounts, QueueStore, Transition};

/// Column order shared by every task query; see `row_to_task`.
const TASK_COLUMNS: &str = "task_id, entity_type, entity_id, function_name, payload, status, \
     error_message, retry_count, max_retries, retry_after, created_at, updated_at";

const PLANNER_COLUMNS: &str = "id, status, next_task, state, created_at, updated_at";

const WORKER_COLUMNS: &str =
    "id, planner_id, kind, task_status, next_task, state, created_at, updated_at";

/// Queue store on a single libSQL connection.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open the database file at `path`, creating parent directories, then
    /// migrate it.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("cannot open {}: {e}", path.display())))?;
        let backend = Self::from_database(db)?;

        // Both pragmas return a row, so they go through `query`.
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA busy_timeout = 5000"] {
            backend
                .conn
                .query(pragma, ())
                .await
                .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
        }

        backend.run_migrations().await?;
        info!(path = %path.display(), "Queue database ready");
        Ok(backend)
    }

    /// Private in-memory database, gone when the backend is dropped.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("cannot open in-memory database: {e}")))?;
        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("cannot connect: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            lock: Mutex::new(()),
        })
    }

    async fn begin(&self) -> Result<libsql::Transaction, DatabaseError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to begin transaction: {e}")))
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const EARLIEST_TS: &str = "0000-01-01T00:00:00.000000Z";
const LATEST_TS: &str = "9999-12-31T23:59:59.999999Z";

/// Fixed-width UTC form; lexical order is chronological order. Instants
/// outside years 0000..=9999 are clamped so the width never changes.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    match ts.year() {
        y if y < 0 => EARLIEST_TS.to_string(),
        y if y > 9999 => LATEST_TS.to_string(),
        _ => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
    }
}

/// Accepts what `fmt_ts` writes as well as SQLite's `datetime('now')` form.
fn parse_ts(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!(
        "Invalid timestamp in database: {s}"
    )))
}

fn opt_value(s: Option<String>) -> Value {
    s.map_or(Value::Null, Value::Text)
}

fn query_err(context: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("constraint failed") {
        DatabaseError::Constraint(format!("{context}: {msg}"))
    } else {
        DatabaseError::Query(format!("{context}: {msg}"))
    }
}

fn ser_err(e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Serialization(e.to_string())
}

fn not_found(entity: EntityRef) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.entity_type().to_string(),
        id: entity.id().to_string(),
    }
}

fn get_text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("Failed to read column {idx}: {e}")))
}

fn get_opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>, DatabaseError> {
    match row
        .get_value(idx)
        .map_err(|e| DatabaseError::Query(format!("Failed to read column {idx}: {e}")))?
    {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        other => Err(ser_err(format!("Expected text in column {idx}, got {other:?}"))),
    }
}

fn get_u32(row: &libsql::Row, idx: i32) -> Result<u32, DatabaseError> {
    let v = row
        .get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("Failed to read column {idx}: {e}")))?;
    u32::try_from(v).map_err(ser_err)
}

fn get_count(row: &libsql::Row, idx: i32) -> Result<u64, DatabaseError> {
    let v = row
        .get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("Failed to read count: {e}")))?;
    u64::try_from(v).map_err(ser_err)
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(ser_err)
}

fn parse_json(s: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s).map_err(ser_err)
}

fn parse_opt_function(s: Option<String>) -> Result<Option<TaskFunction>, DatabaseError> {
    s.map(|s| s.parse::<TaskFunction>().map_err(ser_err))
        .transpose()
}

/// Map a task row. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<TaskQueueEntry, DatabaseError> {
    let task_id = parse_uuid(&get_text(row, 0)?)?;
    let entity = EntityRef::parse(&get_text(row, 1)?, &get_text(row, 2)?).map_err(ser_err)?;
    let function: TaskFunction = get_text(row, 3)?.parse().map_err(ser_err)?;
    let payload = get_opt_text(row, 4)?
        .map(|p| parse_json(&p))
        .transpose()?;
    let status: TaskStatus = get_text(row, 5)?.parse().map_err(ser_err)?;
    let retry_after = get_opt_text(row, 9)?
        .map(|s| parse_ts(&s))
        .transpose()?;

    Ok(TaskQueueEntry {
        task_id,
        entity,
        function,
        payload,
        status,
        error_message: get_opt_text(row, 6)?,
        retry_count: get_u32(row, 7)?,
        max_retries: get_u32(row, 8)?,
        retry_after,
        created_at: parse_ts(&get_text(row, 10)?)?,
        updated_at: parse_ts(&get_text(row, 11)?)?,
    })
}

fn row_to_planner(row: &libsql::Row) -> Result<PlannerRecord, DatabaseError> {
    Ok(PlannerRecord {
        id: parse_uuid(&get_text(row, 0)?)?,
        status: get_text(row, 1)?.parse().map_err(ser_err)?,
        next_task: parse_opt_function(get_opt_text(row, 2)?)?,
        state: parse_json(&get_text(row, 3)?)?,
        created_at: parse_ts(&get_text(row, 4)?)?,
        updated_at: parse_ts(&get_text(row, 5)?)?,
    })
}

fn row_to_worker(row: &libsql::Row) -> Result<WorkerRecord, DatabaseError> {
    Ok(WorkerRecord {
        id: parse_uuid(&get_text(row, 0)?)?,
        planner_id: get_opt_text(row, 1)?
            .map(|s| parse_uuid(&s))
            .transpose()?,
        kind: get_text(row, 2)?.parse().map_err(ser_err)?,
        task_status: get_text(row, 3)?.parse().map_err(ser_err)?,
        next_task: parse_opt_function(get_opt_text(row, 4)?)?,
        state: parse_json(&get_text(row, 5)?)?,
        created_at: parse_ts(&get_text(row, 6)?)?,
        updated_at: parse_ts(&get_text(row, 7)?)?,
    })
}

async fn collect_tasks(mut rows: libsql::Rows) -> Result<Vec<TaskQueueEntry>, DatabaseError> {
    let mut tasks = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| query_err("Failed to read task row", e))?
    {
        tasks.push(row_to_task(&row)?);
    }
    Ok(tasks)
}

// ── Statements shared between transactions ──────────────────────────

async fn entity_exists(conn: &Connection, entity: EntityRef) -> Result<bool, DatabaseError> {
    let sql = match entity {
        EntityRef::Planner(_) => "SELECT COUNT(*) FROM planners WHERE id = ?1",
        EntityRef::Worker(_) => "SELECT COUNT(*) FROM workers WHERE id = ?1",
    };
    let mut rows = conn
        .query(sql, params![entity.id().to_string()])
        .await
        .map_err(|e| query_err("Failed to check entity", e))?;
    match rows
        .next()
        .await
        .map_err(|e| query_err("Failed to read entity check", e))?
    {
        Some(row) => Ok(get_count(&row, 0)? > 0),
        None => Ok(false),
    }
}

async fn task_status(conn: &Connection, task_id: Uuid) -> Result<Option<TaskStatus>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT status FROM task_queue WHERE task_id = ?1",
            params![task_id.to_string()],
        )
        .await
        .map_err(|e| query_err("Failed to read task status", e))?;
    match rows
        .next()
        .await
        .map_err(|e| query_err("Failed to read task status", e))?
    {
        Some(row) => Ok(Some(get_text(&row, 0)?.parse().map_err(ser_err)?)),
        None => Ok(None),
    }
}

/// Existence check plus insert. Must run inside a transaction.
async fn insert_task_row(
    conn: &Connection,
    task: &NewTask,
    now: DateTime<Utc>,
) -> Result<TaskQueueEntry, DatabaseError> {
    if !entity_exists(conn, task.entity).await? {
        return Err(not_found(task.entity));
    }

    let payload = task
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(ser_err)?;
    let ts = fmt_ts(now);

    conn.execute(
        "INSERT INTO task_queue (task_id, entity_type, entity_id, function_name, payload, \
         status, retry_count, max_retries, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?7)",
        params![
            task.task_id.to_string(),
            task.entity.entity_type().as_str(),
            task.entity.id().to_string(),
            task.function.as_str(),
            opt_value(payload),
            i64::from(task.max_retries),
            ts,
        ],
    )
    .await
    .map_err(|e| query_err("Failed to insert task", e))?;

    Ok(TaskQueueEntry {
        task_id: task.task_id,
        entity: task.entity,
        function: task.function,
        payload: task.payload.clone(),
        status: TaskStatus::Pending,
        error_message: None,
        retry_count: 0,
        max_retries: task.max_retries,
        retry_after: None,
        created_at: now,
        updated_at: now,
    })
}

async fn complete_in_tx(
    conn: &Connection,
    task_id: Uuid,
    commit: &CompletionCommit,
    now: DateTime<Utc>,
) -> Result<Transition<Option<Uuid>>, DatabaseError> {
    let ts = fmt_ts(now);
    let updated = conn
        .execute(
            "UPDATE task_queue SET status = 'completed', error_message = NULL, \
             retry_after = NULL, updated_at = ?1 \
             WHERE task_id = ?2 AND status = 'in_progress'",
            params![ts.clone(), task_id.to_string()],
        )
        .await
        .map_err(|e| query_err("Failed to complete task", e))?;
    if updated == 0 {
        return Ok(Transition::Conflict {
            current: task_status(conn, task_id).await?,
        });
    }

    let sql = match (commit.entity, commit.status) {
        (EntityRef::Planner(_), None | Some(EntityStatus::Planner(_))) => {
            "UPDATE planners SET status = COALESCE(?1, status), state = COALESCE(?2, state), \
             next_task = ?3, updated_at = ?4 WHERE id = ?5"
        }
        (EntityRef::Worker(_), None | Some(EntityStatus::Worker(_))) => {
            "UPDATE workers SET task_status = COALESCE(?1, task_status), \
             state = COALESCE(?2, state), next_task = ?3, updated_at = ?4 WHERE id = ?5"
        }
        (entity, Some(status)) => {
            return Err(DatabaseError::Constraint(format!(
                "Status {status} does not belong to {entity}"
            )));
        }
    };
    let state = commit
        .state
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(ser_err)?;
    let touched = conn
        .execute(
            sql,
            params![
                opt_value(commit.status.map(|s| s.as_str().to_string())),
                opt_value(state),
                opt_value(commit.next_task.map(|f| f.as_str().to_string())),
                ts,
                commit.entity.id().to_string(),
            ],
        )
        .await
        .map_err(|e| query_err("Failed to update entity", e))?;
    if touched == 0 {
        return Err(not_found(commit.entity));
    }

    let continuation = match &commit.continuation {
        Some(next) => Some(insert_task_row(conn, next, now).await?.task_id),
        None => None,
    };
    if let Some(gated) = &commit.after_workers {
        release_after_workers(conn, gated, now).await?;
    }
    Ok(Transition::Applied(continuation))
}

/// Insert a planner stage gated on its workers, if the gate is open.
///
/// Whichever commits last (the planner reaching the gate, or its last worker
/// finishing) sees the gate open, so the stage is queued exactly once.
async fn release_after_workers(
    conn: &Connection,
    task: &NewTask,
    now: DateTime<Utc>,
) -> Result<Option<Uuid>, DatabaseError> {
    let EntityRef::Planner(planner_id) = task.entity else {
        return Err(DatabaseError::Constraint(format!(
            "Worker-gated stage must target a planner, got {}",
            task.entity
        )));
    };

    let (waiting, unfinished, queued) = {
        let mut rows = conn
            .query(
                "SELECT \
                   (SELECT COUNT(*) FROM planners WHERE id = ?1 AND next_task = ?2), \
                   (SELECT COUNT(*) FROM workers WHERE planner_id = ?1 \
                      AND task_status NOT IN ('completed', 'recorded')), \
                   (SELECT COUNT(*) FROM task_queue WHERE entity_type = 'planner' \
                      AND entity_id = ?1 AND function_name = ?2 \
                      AND status IN ('pending', 'in_progress'))",
                params![planner_id.to_string(), task.function.as_str()],
            )
            .await
            .map_err(|e| query_err("Failed to check worker gate", e))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("Failed to read worker gate", e))?
        else {
            return Ok(None);
        };
        (get_count(&row, 0)?, get_count(&row, 1)?, get_count(&row, 2)?)
    };

    if waiting == 0 || unfinished > 0 || queued > 0 {
        debug!(
            planner_id = %planner_id,
            function = %task.function,
            unfinished,
            "Worker gate still closed"
        );
        return Ok(None);
    }

    let entry = insert_task_row(conn, task, now).await?;
    info!(
        task_id = %entry.task_id,
        planner_id = %planner_id,
        function = %task.function,
        "Workers finished, planner stage released"
    );
    Ok(Some(entry.task_id))
}

#[async_trait]
impl QueueStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        migrations::run_migrations(&self.conn).await
    }

    // ── Entities ────────────────────────────────────────────────────

    async fn insert_planner(&self, planner: &PlannerRecord) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let state = serde_json::to_string(&planner.state).map_err(ser_err)?;
        self.conn
            .execute(
                "INSERT INTO planners (id, status, next_task, state, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    planner.id.to_string(),
                    planner.status.as_str(),
                    opt_value(planner.next_task.map(|f| f.as_str().to_string())),
                    state,
                    fmt_ts(planner.created_at),
                    fmt_ts(planner.updated_at),
                ],
            )
            .await
            .map_err(|e| query_err("Failed to insert planner", e))?;
        debug!(planner_id = %planner.id, "Inserted planner");
        Ok(())
    }

    async fn insert_worker(&self, worker: &WorkerRecord) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let state = serde_json::to_string(&worker.state).map_err(ser_err)?;
        let tx = self.begin().await?;

        if let Some(planner_id) = worker.planner_id {
            match entity_exists(&tx, EntityRef::Planner(planner_id)).await {
                Ok(true) => {}
                Ok(false) => {
                    let _ = tx.rollback().await;
                    return Err(not_found(EntityRef::Planner(planner_id)));
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            }
        }

        let inserted = tx
            .execute(
                "INSERT INTO workers (id, planner_id, kind, task_status, next_task, state, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    worker.id.to_string(),
                    opt_value(worker.planner_id.map(|id| id.to_string())),
                    worker.kind.as_str(),
                    worker.task_status.as_str(),
                    opt_value(worker.next_task.map(|f| f.as_str().to_string())),
                    state,
                    fmt_ts(worker.created_at),
                    fmt_ts(worker.updated_at),
                ],
            )
            .await
            .map_err(|e| query_err("Failed to insert worker", e));
        if let Err(e) = inserted {
            let _ = tx.rollback().await;
            return Err(e);
        }

        tx.commit()
            .await
            .map_err(|e| query_err("Failed to commit worker insert", e))?;
        debug!(worker_id = %worker.id, kind = %worker.kind, "Inserted worker");
        Ok(())
    }

    async fn get_entity(&self, entity: EntityRef) -> Result<Option<EntitySnapshot>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let sql = match entity {
            EntityRef::Planner(_) => format!("SELECT {PLANNER_COLUMNS} FROM planners WHERE id = ?1"),
            EntityRef::Worker(_) => format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
        };
        let mut rows = self
            .conn
            .query(&sql, params![entity.id().to_string()])
            .await
            .map_err(|e| query_err("Failed to query entity", e))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("Failed to read entity row", e))?
        else {
            return Ok(None);
        };
        let snapshot = match entity {
            EntityRef::Planner(_) => EntitySnapshot::Planner(row_to_planner(&row)?),
            EntityRef::Worker(_) => EntitySnapshot::Worker(row_to_worker(&row)?),
        };
        Ok(Some(snapshot))
    }

    async fn list_workers(&self, planner_id: Uuid) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {WORKER_COLUMNS} FROM workers WHERE planner_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![planner_id.to_string()],
            )
            .await
            .map_err(|e| query_err("Failed to list workers", e))?;

        let mut workers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("Failed to read worker row", e))?
        {
            workers.push(row_to_worker(&row)?);
        }
        Ok(workers)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(
        &self,
        task: &NewTask,
        now: DateTime<Utc>,
    ) -> Result<TaskQueueEntry, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin().await?;
        match insert_task_row(&tx, task, now).await {
            Ok(entry) => {
                tx.commit()
                    .await
                    .map_err(|e| query_err("Failed to commit task insert", e))?;
                Ok(entry)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskQueueEntry>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE task_id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| query_err("Failed to query task", e))?;
        Ok(collect_tasks(rows).await?.into_iter().next())
    }

    async fn list_entity_tasks(
        &self,
        entity: EntityRef,
    ) -> Result<Vec<TaskQueueEntry>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_queue \
                     WHERE entity_type = ?1 AND entity_id = ?2 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![entity.entity_type().as_str(), entity.id().to_string()],
            )
            .await
            .map_err(|e| query_err("Failed to list entity tasks", e))?;
        collect_tasks(rows).await
    }

    async fn select_eligible(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskQueueEntry>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM ( \
                 SELECT {TASK_COLUMNS}, \
                        ROW_NUMBER() OVER (PARTITION BY entity_type, entity_id \
                                           ORDER BY created_at ASC, rowid ASC) AS entity_rank, \
                        rowid AS seq \
                 FROM task_queue WHERE status = 'pending' \
             ) AS pending \
             WHERE entity_rank = 1 \
               AND (retry_after IS NULL OR retry_after <= ?1) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM task_queue AS running \
                   WHERE running.entity_type = pending.entity_type \
                     AND running.entity_id = pending.entity_id \
                     AND running.status = 'in_progress') \
             ORDER BY created_at ASC, seq ASC \
             LIMIT ?2"
        );
        let rows = self
            .conn
            .query(&sql, params![fmt_ts(now), limit])
            .await
            .map_err(|e| query_err("Failed to select eligible tasks", e))?;
        collect_tasks(rows).await
    }

    async fn in_progress_entities(&self) -> Result<HashSet<EntityRef>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, entity_id FROM task_queue WHERE status = 'in_progress'",
                (),
            )
            .await
            .map_err(|e| query_err("Failed to query in-progress entities", e))?;

        let mut keys = HashSet::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("Failed to read entity key", e))?
        {
            keys.insert(
                EntityRef::parse(&get_text(&row, 0)?, &get_text(&row, 1)?).map_err(ser_err)?,
            );
        }
        Ok(keys)
    }

    async fn claim_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let result = self
            .conn
            .execute(
                "UPDATE task_queue SET status = 'in_progress', retry_after = NULL, updated_at = ?1 \
                 WHERE task_id = ?2 AND status = 'pending' \
                   AND (retry_after IS NULL OR retry_after <= ?1) \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM task_queue AS running \
                       WHERE running.entity_type = task_queue.entity_type \
                         AND running.entity_id = task_queue.entity_id \
                         AND running.status = 'in_progress')",
                params![fmt_ts(now), task_id.to_string()],
            )
            .await
            .map_err(|e| query_err("Failed to claim task", e));

        match result {
            Ok(n) => Ok(n == 1),
            // Another connection claimed a sibling between our check and write.
            Err(DatabaseError::Constraint(msg)) => {
                debug!(task_id = %task_id, error = %msg, "Claim lost to entity exclusion");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        commit: &CompletionCommit,
        now: DateTime<Utc>,
    ) -> Result<Transition<Option<Uuid>>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin().await?;
        match complete_in_tx(&tx, task_id, commit, now).await {
            Ok(Transition::Applied(next)) => {
                tx.commit()
                    .await
                    .map_err(|e| query_err("Failed to commit completion", e))?;
                Ok(Transition::Applied(next))
            }
            Ok(conflict) => {
                let _ = tx.rollback().await;
                Ok(conflict)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error_message: &str,
        retry_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Transition<FailureOutcome>, DatabaseError> {
        let _guard = self.lock.lock().await;
        // SET expressions all see the pre-update row, so one statement both
        // decides and applies requeue vs. exhaustion.
        let mut rows = self
            .conn
            .query(
                "UPDATE task_queue SET \
                     status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END, \
                     retry_count = CASE WHEN retry_count < max_retries \
                                        THEN retry_count + 1 ELSE retry_count END, \
                     retry_after = CASE WHEN retry_count < max_retries THEN ?1 ELSE NULL END, \
                     error_message = ?2, \
                     updated_at = ?3 \
                 WHERE task_id = ?4 AND status = 'in_progress' \
                 RETURNING status, retry_count, retry_after",
                params![
                    opt_value(retry_after.map(fmt_ts)),
                    error_message,
                    fmt_ts(now),
                    task_id.to_string(),
                ],
            )
            .await
            .map_err(|e| query_err("Failed to record task failure", e))?;

        let row = rows
            .next()
            .await
            .map_err(|e| query_err("Failed to read failure result", e))?;
        let Some(row) = row else {
            drop(rows);
            return Ok(Transition::Conflict {
                current: task_status(&self.conn, task_id).await?,
            });
        };

        let status: TaskStatus = get_text(&row, 0)?.parse().map_err(ser_err)?;
        let retry_count = get_u32(&row, 1)?;
        let outcome = match status {
            TaskStatus::Pending => FailureOutcome::Requeued {
                retry_count,
                retry_after: get_opt_text(&row, 2)?
                    .map(|s| parse_ts(&s))
                    .transpose()?,
            },
            _ => FailureOutcome::Exhausted { retry_count },
        };
        Ok(Transition::Applied(outcome))
    }

    async fn reset_stale(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "UPDATE task_queue SET status = 'pending', error_message = ?1, \
                 retry_after = NULL, updated_at = ?2 \
                 WHERE status = 'in_progress' AND updated_at < ?3 \
                 RETURNING task_id",
                params![message, fmt_ts(now), fmt_ts(cutoff)],
            )
            .await
            .map_err(|e| query_err("Failed to reset stale tasks", e))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("Failed to read reset task id", e))?
        {
            ids.push(parse_uuid(&get_text(&row, 0)?)?);
        }
        Ok(ids)
    }

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<PurgeCounts, DatabaseError> {
        let _guard = self.lock.lock().await;
        let completed = self
            .conn
            .execute(
                "DELETE FROM task_queue WHERE status = 'completed' AND updated_at < ?1",
                params![fmt_ts(completed_before)],
            )
            .await
            .map_err(|e| query_err("Failed to purge completed tasks", e))?;
        let failed = self
            .conn
            .execute(
                "DELETE FROM task_queue \
                 WHERE status = 'failed' AND retry_count >= max_retries AND updated_at < ?1",
                params![fmt_ts(failed_before)],
            )
            .await
            .map_err(|e| query_err("Failed to purge failed tasks", e))?;
        Ok(PurgeCounts { completed, failed })
    }

    async fn queue_stats(
        &self,
        stale_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<QueueStats, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut stats = QueueStats::default();

        let grouped = |column: &str| format!("SELECT {column}, COUNT(*) FROM task_queue GROUP BY {column}");

        let mut rows = self
            .conn
            .query(&grouped("status"), ())
            .await
            .map_err(|e| query_err("Failed to count by status", e))?;
        while let Some(row) = rows.next().await.map_err(|e| query_err("Failed to read stats", e))? {
            let status: TaskStatus = get_text(&row, 0)?.parse().map_err(ser_err)?;
            let n = get_count(&row, 1)?;
            stats.total += n;
            stats.by_status.insert(status, n);
        }

        let mut rows = self
            .conn
            .query(&grouped("function_name"), ())
            .await
            .map_err(|e| query_err("Failed to count by function", e))?;
        let mut by_function = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(|e| query_err("Failed to read stats", e))? {
            let function: TaskFunction = get_text(&row, 0)?.parse().map_err(ser_err)?;
            by_function.insert(function, get_count(&row, 1)?);
        }
        stats.by_function = by_function;

        let mut rows = self
            .conn
            .query(&grouped("entity_type"), ())
            .await
            .map_err(|e| query_err("Failed to count by entity type", e))?;
        while let Some(row) = rows.next().await.map_err(|e| query_err("Failed to read stats", e))? {
            let entity_type: EntityType = get_text(&row, 0)?.parse().map_err(ser_err)?;
            stats.by_entity_type.insert(entity_type, get_count(&row, 1)?);
        }

        let mut rows = self
            .conn
            .query(
                "SELECT MIN(created_at), \
                        (SELECT COUNT(*) FROM task_queue \
                         WHERE status = 'in_progress' AND updated_at < ?1), \
                        (SELECT COUNT(*) FROM task_queue \
                         WHERE status = 'failed' AND retry_count >= max_retries) \
                 FROM task_queue WHERE status = 'pending'",
                params![fmt_ts(stale_cutoff)],
            )
            .await
            .map_err(|e| query_err("Failed to query queue age", e))?;
        if let Some(row) = rows.next().await.map_err(|e| query_err("Failed to read stats", e))? {
            if let Some(oldest) = get_opt_text(&row, 0)? {
                stats.oldest_pending_age = (now - parse_ts(&oldest)?).to_std().ok();
            }
            stats.stale_count = get_count(&row, 1)?;
            stats.exhausted_count = get_count(&row, 2)?;
        }

        Ok(stats)
    }
}
