//! Queue row types and monitoring snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::function::TaskFunction;
use super::state::TaskStatus;
use crate::entity::{EntityRef, EntityType};

/// Default retry budget for a newly enqueued task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// `now - age`, saturating at the earliest representable instant. An age
/// too large to subtract selects nothing instead of everything.
pub(crate) fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `now + delay`, saturating at the latest representable instant.
pub(crate) fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A persisted work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskQueueEntry {
    pub task_id: Uuid,
    pub entity: EntityRef,
    pub function: TaskFunction,
    pub payload: Option<serde_json::Value>,
    pub status: TaskStatus,
    /// Set whenever the task is FAILED; kept on a requeued or reaped PENDING
    /// row as the reason for the previous attempt; cleared on completion.
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Not eligible for claiming before this instant.
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskQueueEntry {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal(self.retry_count, self.max_retries)
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

/// A validated task about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_id: Uuid,
    pub entity: EntityRef,
    pub function: TaskFunction,
    pub payload: Option<serde_json::Value>,
    pub max_retries: u32,
}

impl NewTask {
    pub fn new(entity: EntityRef, function: TaskFunction) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            entity,
            function,
            payload: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_payload(mut self, payload: Option<serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Aggregate view of the queue for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub by_status: BTreeMap<TaskStatus, u64>,
    pub by_function: BTreeMap<TaskFunction, u64>,
    pub by_entity_type: BTreeMap<EntityType, u64>,
    /// Age of the oldest PENDING task.
    pub oldest_pending_age: Option<Duration>,
    /// IN_PROGRESS tasks older than the stale threshold.
    pub stale_count: u64,
    /// FAILED tasks with no retries left.
    pub exhausted_count: u64,
}

impl QueueStats {
    pub fn count(&self, status: TaskStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_arithmetic_saturates_instead_of_wrapping() {
        let now = Utc::now();
        assert_eq!(
            cutoff_before(now, Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
        assert_eq!(cutoff_before(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        // Fits in chrono, but subtracting it would underflow.
        let huge = Duration::from_secs(i64::MAX as u64 / 1000);
        assert_eq!(cutoff_before(now, huge), DateTime::<Utc>::MIN_UTC);

        assert_eq!(deadline_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(deadline_after(now, Duration::ZERO), now);
    }

    #[test]
    fn new_task_defaults_to_three_retries() {
        let task = NewTask::new(EntityRef::Planner(Uuid::new_v4()), TaskFunction::Intake);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert!(task.payload.is_none());

        let task = task
            .with_max_retries(0)
            .with_payload(Some(serde_json::json!({"q": "hi"})));
        assert_eq!(task.max_retries, 0);
        assert_eq!(task.payload.unwrap()["q"], "hi");
    }

    #[test]
    fn stats_count_defaults_to_zero() {
        let mut stats = QueueStats::default();
        stats.by_status.insert(TaskStatus::Pending, 4);
        assert_eq!(stats.count(TaskStatus::Pending), 4);
        assert_eq!(stats.count(TaskStatus::Failed), 0);
    }
}
