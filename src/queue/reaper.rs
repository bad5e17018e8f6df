//! Stale-task reaper: the recovery path for a dispatcher that died mid-task.
//!
//! IN_PROGRESS tasks not updated within the threshold are reset to PENDING
//! with an explanatory message. `retry_count` is left alone; a timeout is not
//! the handler's fault.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::model::cutoff_before;
use crate::error::Result;
use crate::store::QueueStore;

#[derive(Debug, Clone, PartialEq)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(30 * 60),
        }
    }
}

pub struct StaleTaskReaper {
    store: Arc<dyn QueueStore>,
    config: ReaperConfig,
}

impl StaleTaskReaper {
    pub fn new(store: Arc<dyn QueueStore>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Reset stale tasks. Returns the ids that were reset.
    pub async fn sweep(&self) -> Result<Vec<Uuid>> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let cutoff = cutoff_before(now, self.config.stale_threshold);
        let message = format!(
            "Reset by stale-task reaper: no progress for more than {}s",
            self.config.stale_threshold.as_secs()
        );

        let reset = self.store.reset_stale(cutoff, &message, now).await?;
        for task_id in &reset {
            warn!(task_id = %task_id, "Stale task reset to pending");
        }
        if !reset.is_empty() {
            info!(count = reset.len(), "Stale-task sweep reset tasks");
        }
        Ok(reset)
    }
}

/// Spawn the periodic reaper sweep.
pub fn spawn_reaper_task(reaper: Arc<StaleTaskReaper>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = reaper.config.interval.as_secs(),
            stale_after_secs = reaper.config.stale_threshold.as_secs(),
            "Stale-task reaper started"
        );
        let mut interval = tokio::time::interval(reaper.config.interval);
        loop {
            interval.tick().await;
            if let Err(e) = reaper.sweep().await {
                warn!(error = %e, "Stale-task sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityRef, WorkerKind, WorkerRecord};
    use crate::queue::{NewTask, TaskFunction, TaskStatus};
    use crate::store::LibSqlBackend;

    async fn running_task(store: &LibSqlBackend, claimed_at: DateTime<Utc>) -> Uuid {
        let worker = WorkerRecord::new(None, WorkerKind::Standard, serde_json::json!({}));
        store.insert_worker(&worker).await.unwrap();
        let task = NewTask::new(EntityRef::Worker(worker.id), TaskFunction::ExecuteStandardWorker);
        store.insert_task(&task, claimed_at).await.unwrap();
        assert!(store.claim_task(task.task_id, claimed_at).await.unwrap());
        task.task_id
    }

    #[tokio::test]
    async fn only_tasks_past_threshold_are_reset() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        let old = running_task(&store, now - chrono::Duration::minutes(45)).await;
        let fresh = running_task(&store, now - chrono::Duration::minutes(5)).await;

        let reaper = StaleTaskReaper::new(store.clone(), ReaperConfig::default());
        assert_eq!(reaper.sweep_at(now).await.unwrap(), vec![old]);

        let old = store.get_task(old).await.unwrap().unwrap();
        assert_eq!(old.status, TaskStatus::Pending);
        assert_eq!(old.retry_count, 0);
        assert!(old.error_message.unwrap().starts_with("Reset by stale-task reaper"));

        let fresh = store.get_task(fresh).await.unwrap().unwrap();
        assert_eq!(fresh.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn unrepresentable_threshold_reaps_nothing() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        let id = running_task(&store, now - chrono::Duration::days(3650)).await;

        let reaper = StaleTaskReaper::new(
            store.clone(),
            ReaperConfig {
                interval: Duration::from_secs(60),
                stale_threshold: Duration::MAX,
            },
        );
        assert!(reaper.sweep_at(now).await.unwrap().is_empty());
        assert_eq!(
            store.get_task(id).await.unwrap().unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_reaper_sweeps_on_every_tick() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let stale_at = Utc::now() - chrono::Duration::hours(1);
        let first = running_task(&store, stale_at).await;

        let reaper = Arc::new(StaleTaskReaper::new(store.clone(), ReaperConfig::default()));
        let handle = spawn_reaper_task(reaper);

        wait_until_pending(&store, first).await;
        let second = running_task(&store, stale_at).await;
        wait_until_pending(&store, second).await;
        handle.abort();
    }

    async fn wait_until_pending(store: &LibSqlBackend, id: Uuid) {
        for _ in 0..100 {
            if store.get_task(id).await.unwrap().unwrap().status == TaskStatus::Pending {
                return;
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        panic!("task {id} was never reset");
    }

    #[tokio::test]
    async fn repeated_sweeps_are_idempotent() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        let id = running_task(&store, now - chrono::Duration::hours(2)).await;

        let reaper = StaleTaskReaper::new(store.clone(), ReaperConfig::default());
        assert_eq!(reaper.sweep_at(now).await.unwrap().len(), 1);
        for _ in 0..3 {
            assert!(reaper.sweep_at(now).await.unwrap().is_empty());
        }
        assert_eq!(store.get_task(id).await.unwrap().unwrap().retry_count, 0);
    }
}
