//! `QueueStore` trait: the single async interface over the task table and
//! the entity state tables.
//!
//! Every method that changes more than one row is one atomic unit in the
//! backend. Transitions are conditional on the task's current status; a
//! method reports [`Transition::Conflict`] instead of writing when the row is
//! not where the caller expected it.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entity::{EntityRef, EntitySnapshot, EntityStatus, PlannerRecord, WorkerRecord};
use crate::error::DatabaseError;
use crate::queue::{NewTask, QueueStats, TaskFunction, TaskQueueEntry, TaskStatus};

/// Result of a conditional task transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<T> {
    Applied(T),
    /// The row was not in the expected state. `current` is `None` when the
    /// row no longer exists.
    Conflict { current: Option<TaskStatus> },
}

/// Everything written when a handler succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionCommit {
    pub entity: EntityRef,
    /// New entity status, if it changes.
    pub status: Option<EntityStatus>,
    /// Replacement state document, if any.
    pub state: Option<serde_json::Value>,
    /// Always written; `None` clears the pointer at the end of a chain.
    pub next_task: Option<TaskFunction>,
    pub continuation: Option<NewTask>,
    /// Planner stage held back until the planner's workers have all finished.
    /// Inserted in the same unit only if, after this commit, the planner's
    /// `next_task` names it, no worker is still unfinished and no live copy
    /// is already queued.
    pub after_workers: Option<NewTask>,
}

/// Where a failed task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to PENDING with one more retry consumed.
    Requeued {
        retry_count: u32,
        retry_after: Option<DateTime<Utc>>,
    },
    /// Terminal FAILED; no retries were left.
    Exhausted { retry_count: u32 },
}

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub completed: u64,
    pub failed: u64,
}

impl PurgeCounts {
    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Entities ────────────────────────────────────────────────────

    async fn insert_planner(&self, planner: &PlannerRecord) -> Result<(), DatabaseError>;

    /// Insert a worker. Fails with `NotFound` if its owning planner is missing.
    async fn insert_worker(&self, worker: &WorkerRecord) -> Result<(), DatabaseError>;

    async fn get_entity(&self, entity: EntityRef) -> Result<Option<EntitySnapshot>, DatabaseError>;

    /// Workers owned by a planner, oldest first.
    async fn list_workers(&self, planner_id: Uuid) -> Result<Vec<WorkerRecord>, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a PENDING task. The entity existence check and the insert are
    /// one unit; a missing entity yields `NotFound` and writes nothing.
    async fn insert_task(
        &self,
        task: &NewTask,
        now: DateTime<Utc>,
    ) -> Result<TaskQueueEntry, DatabaseError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskQueueEntry>, DatabaseError>;

    /// Queue history of one entity, oldest first.
    async fn list_entity_tasks(
        &self,
        entity: EntityRef,
    ) -> Result<Vec<TaskQueueEntry>, DatabaseError>;

    /// Claim candidates: PENDING, past `retry_after`, the oldest pending task
    /// of its entity, and no IN_PROGRESS task on the same entity. FIFO by
    /// `created_at`, at most `limit` rows.
    async fn select_eligible(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskQueueEntry>, DatabaseError>;

    /// Entity keys currently holding an IN_PROGRESS task.
    async fn in_progress_entities(&self) -> Result<HashSet<EntityRef>, DatabaseError>;

    /// PENDING → IN_PROGRESS, guarded by the prior status and the entity's
    /// exclusion. Returns `false` when another claimant won.
    async fn claim_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// IN_PROGRESS → COMPLETED together with the entity patch and the
    /// continuation insert. Returns the continuation's task id.
    async fn complete_task(
        &self,
        task_id: Uuid,
        commit: &CompletionCommit,
        now: DateTime<Utc>,
    ) -> Result<Transition<Option<Uuid>>, DatabaseError>;

    /// Record a failure of an IN_PROGRESS task: requeue while
    /// `retry_count < max_retries`, otherwise terminal FAILED.
    async fn fail_task(
        &self,
        task_id: Uuid,
        error_message: &str,
        retry_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Transition<FailureOutcome>, DatabaseError>;

    /// Reset IN_PROGRESS tasks last updated before `cutoff` to PENDING,
    /// leaving `retry_count` alone. Returns the reset task ids.
    async fn reset_stale(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    /// Delete COMPLETED tasks older than `completed_before` and exhausted
    /// FAILED tasks older than `failed_before`.
    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<PurgeCounts, DatabaseError>;

    async fn queue_stats(
        &self,
        stale_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<QueueStats, DatabaseError>;
}
