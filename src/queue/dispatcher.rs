//! Dispatcher: claims eligible tasks and runs their handlers.
//!
//! One poll step:
//! 1. Read the entity keys that already hold an IN_PROGRESS task.
//! 2. Select PENDING candidates in FIFO order and keep at most one per
//!    entity, skipping busy entities.
//! 3. Claim each candidate with a conditional update; a lost race is skipped.
//! 4. Run the claimed handlers concurrently and record each outcome in one
//!    atomic store write (completion + entity patch + continuation, or
//!    failure + requeue).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{Continuation, HandlerContext, HandlerOutcome};
use super::model::{NewTask, TaskQueueEntry};
use super::retry::RetryPolicy;
use super::service::TaskQueue;
use super::state::TaskStatus;
use crate::entity::{EntityRef, EntitySnapshot, WorkerTaskStatus};
use crate::error::{DatabaseError, HandlerError, IntegrityError, Result};
use crate::store::{CompletionCommit, FailureOutcome, Transition};

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Number of concurrent poll loops.
    pub workers: usize,
    /// Sleep between polls that claimed nothing.
    pub poll_interval: Duration,
    /// Maximum tasks claimed per poll.
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(1000),
            batch_size: 16,
        }
    }
}

/// How one claimed task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed { continuation: Option<Uuid> },
    Requeued {
        retry_count: u32,
        retry_after: Option<DateTime<Utc>>,
    },
    /// Terminal FAILED.
    Exhausted { retry_count: u32 },
}

/// Tally of one poll step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub exhausted: usize,
    /// Store or integrity errors; the affected tasks stay IN_PROGRESS until reaped.
    pub errors: usize,
}

pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    config: DispatcherConfig,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(queue: Arc<TaskQueue>, config: DispatcherConfig, retry: RetryPolicy) -> Self {
        Self {
            queue,
            config,
            retry,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim a batch of tasks with pairwise distinct entities.
    pub async fn claim_batch(&self) -> Result<Vec<TaskQueueEntry>> {
        self.claim_batch_at(Utc::now()).await
    }

    pub async fn claim_batch_at(&self, now: DateTime<Utc>) -> Result<Vec<TaskQueueEntry>> {
        let store = self.queue.store();

        let mut busy = store.in_progress_entities().await?;
        let candidates = store.select_eligible(self.config.batch_size, now).await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for task in candidates {
            if !busy.insert(task.entity) {
                debug!(task_id = %task.task_id, entity = %task.entity, "Entity busy, skipping");
                continue;
            }
            if !store.claim_task(task.task_id, now).await? {
                debug!(task_id = %task.task_id, "Claim lost to another dispatcher");
                continue;
            }
            info!(
                task_id = %task.task_id,
                entity = %task.entity,
                function = %task.function,
                retry_count = task.retry_count,
                "Task claimed"
            );
            claimed.push(TaskQueueEntry {
                status: TaskStatus::InProgress,
                retry_after: None,
                updated_at: now,
                ..task
            });
        }
        Ok(claimed)
    }

    /// Run the handler for a claimed task and record the outcome.
    pub async fn execute(&self, task: TaskQueueEntry) -> Result<DispatchOutcome> {
        let prepared = match self.invoke(&task).await? {
            Ok((outcome, snapshot)) => self.prepare_commit(&task, snapshot, outcome),
            Err(e) => Err(e),
        };

        match prepared {
            Ok(commit) => self.commit_success(&task, commit).await,
            Err(e) => self.record_failure(&task, e).await,
        }
    }

    /// Claim one batch and execute it.
    pub async fn run_once(&self) -> Result<DispatchReport> {
        let tasks = self.claim_batch().await?;
        let mut report = DispatchReport {
            claimed: tasks.len(),
            ..DispatchReport::default()
        };

        let results = futures::future::join_all(tasks.into_iter().map(|t| self.execute(t))).await;
        for result in results {
            match result {
                Ok(DispatchOutcome::Completed { .. }) => report.completed += 1,
                Ok(DispatchOutcome::Requeued { .. }) => report.requeued += 1,
                Ok(DispatchOutcome::Exhausted { .. }) => report.exhausted += 1,
                Err(e) => {
                    warn!(error = %e, "Failed to record task outcome");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Poll forever. Sleeps only when a poll claimed nothing.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.run_once().await {
                Ok(report) if report.claimed > 0 => {
                    debug!(?report, "Dispatch step finished");
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Dispatcher poll failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Load the entity and run the handler on its own task, so a panic
    /// surfaces as a `JoinError` instead of unwinding the dispatcher.
    async fn invoke(
        &self,
        task: &TaskQueueEntry,
    ) -> Result<std::result::Result<(HandlerOutcome, EntitySnapshot), HandlerError>> {
        let Some(snapshot) = self.queue.store().get_entity(task.entity).await? else {
            return Ok(Err(HandlerError::EntityMissing {
                entity: task.entity.to_string(),
            }));
        };
        let Some(handler) = self.queue.registry().get(task.function) else {
            return Ok(Err(HandlerError::NotRegistered {
                function: task.function,
            }));
        };

        let ctx = HandlerContext {
            task_id: task.task_id,
            function: task.function,
            entity: snapshot.clone(),
            payload: task.payload.clone(),
            retry_count: task.retry_count,
        };

        let outcome = match tokio::spawn(async move { handler.handle(ctx).await }).await {
            Ok(result) => result,
            Err(join_err) => Err(HandlerError::Panicked(panic_message(join_err))),
        };
        Ok(outcome.map(|o| (o, snapshot)))
    }

    /// Validate the handler's outcome against the entity and the pipeline
    /// table, producing the single write that completes the task.
    fn prepare_commit(
        &self,
        task: &TaskQueueEntry,
        mut snapshot: EntitySnapshot,
        outcome: HandlerOutcome,
    ) -> std::result::Result<CompletionCommit, HandlerError> {
        let entity_type = task.entity.entity_type();
        let pipeline = self.queue.pipeline();

        // A status the handler asked for must be a legal move. The table's
        // default is applied only when it is one, so a stage enqueued out of
        // order still completes and leaves the entity status as it was.
        let current = snapshot.status();
        let status = match outcome.patch.status {
            Some(target) if !current.can_transition_to(target) => {
                return Err(HandlerError::InvalidEntityTransition {
                    entity: task.entity.to_string(),
                    from: current.to_string(),
                    to: target.to_string(),
                });
            }
            Some(target) => Some(target),
            None => pipeline
                .rule(entity_type, task.function)
                .map(|rule| rule.on_success)
                .filter(|target| {
                    let legal = current.can_transition_to(*target);
                    if !legal {
                        debug!(
                            task_id = %task.task_id,
                            entity = %task.entity,
                            from = %current,
                            to = %target,
                            "Keeping entity status; stage ran out of order"
                        );
                    }
                    legal
                }),
        };
        snapshot.apply(status, outcome.patch.state.as_ref());

        let gated = matches!(outcome.continuation, Continuation::Pipeline)
            && pipeline.waits_for_workers(entity_type, task.function);
        let next_task = match outcome.continuation {
            Continuation::Pipeline => pipeline.next_function(&snapshot, task.function),
            Continuation::Stage(function) => Some(function),
            Continuation::Stop => None,
        };
        let next = match next_task {
            Some(function) => {
                self.queue
                    .validate(entity_type, function)
                    .map_err(|e| HandlerError::ContinuationRejected(e.to_string()))?;
                Some(
                    NewTask::new(task.entity, function)
                        .with_payload(outcome.next_payload)
                        .with_max_retries(self.queue.default_max_retries()),
                )
            }
            None => None,
        };
        let (continuation, after_workers) = if gated {
            (None, next)
        } else {
            (next, self.released_planner_stage(&snapshot))
        };

        Ok(CompletionCommit {
            entity: task.entity,
            status,
            state: outcome.patch.state,
            next_task,
            continuation,
            after_workers,
        })
    }

    /// A finished worker may be the last one its planner is waiting on.
    fn released_planner_stage(&self, snapshot: &EntitySnapshot) -> Option<NewTask> {
        let EntitySnapshot::Worker(worker) = snapshot else {
            return None;
        };
        if !matches!(
            worker.task_status,
            WorkerTaskStatus::Completed | WorkerTaskStatus::Recorded
        ) {
            return None;
        }
        let planner_id = worker.planner_id?;
        let function = self.queue.pipeline().worker_gated_stage()?;
        Some(
            NewTask::new(EntityRef::Planner(planner_id), function)
                .with_max_retries(self.queue.default_max_retries()),
        )
    }

    async fn commit_success(
        &self,
        task: &TaskQueueEntry,
        commit: CompletionCommit,
    ) -> Result<DispatchOutcome> {
        let result = self
            .queue
            .store()
            .complete_task(task.task_id, &commit, Utc::now())
            .await;

        match result {
            Ok(Transition::Applied(continuation)) => {
                info!(
                    task_id = %task.task_id,
                    entity = %task.entity,
                    function = %task.function,
                    next = ?commit.next_task,
                    "Task completed"
                );
                Ok(DispatchOutcome::Completed { continuation })
            }
            Ok(Transition::Conflict { current }) => {
                Err(self.integrity_violation(task, current))
            }
            // The unit was rolled back; count it against the task.
            Err(e @ (DatabaseError::NotFound { .. } | DatabaseError::Constraint(_))) => {
                self.record_failure(task, HandlerError::ContinuationRejected(e.to_string()))
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_failure(
        &self,
        task: &TaskQueueEntry,
        err: HandlerError,
    ) -> Result<DispatchOutcome> {
        let now = Utc::now();
        let retry_after = if task.retry_count < task.max_retries {
            self.retry.retry_after(task.retry_count + 1, now)
        } else {
            None
        };
        let message = err.to_string();

        let result = self
            .queue
            .store()
            .fail_task(task.task_id, &message, retry_after, now)
            .await?;

        match result {
            Transition::Applied(FailureOutcome::Requeued {
                retry_count,
                retry_after,
            }) => {
                warn!(
                    task_id = %task.task_id,
                    entity = %task.entity,
                    function = %task.function,
                    retry_count,
                    max_retries = task.max_retries,
                    error = %message,
                    "Task failed, requeued"
                );
                Ok(DispatchOutcome::Requeued {
                    retry_count,
                    retry_after,
                })
            }
            Transition::Applied(FailureOutcome::Exhausted { retry_count }) => {
                warn!(
                    task_id = %task.task_id,
                    entity = %task.entity,
                    function = %task.function,
                    retry_count,
                    error = %message,
                    "Task failed, retries exhausted"
                );
                Ok(DispatchOutcome::Exhausted { retry_count })
            }
            Transition::Conflict { current } => Err(self.integrity_violation(task, current)),
        }
    }

    fn integrity_violation(
        &self,
        task: &TaskQueueEntry,
        current: Option<TaskStatus>,
    ) -> crate::error::Error {
        let err = IntegrityError::unexpected(task.task_id, TaskStatus::InProgress, current);
        // Reachable from IN_PROGRESS means something else moved the row on
        // (usually the reaper); anything else means the row was corrupted.
        let moved_on = current.is_some_and(|s| TaskStatus::InProgress.can_transition_to(s));
        error!(
            task_id = %task.task_id,
            entity = %task.entity,
            function = %task.function,
            moved_on,
            error = %err,
            "Task left IN_PROGRESS while its handler ran"
        );
        err.into()
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "handler task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Spawn `workers` dispatcher poll loops.
pub fn spawn_dispatchers(dispatcher: Arc<Dispatcher>, workers: usize) -> Vec<JoinHandle<()>> {
    let poll_interval_ms =
        u64::try_from(dispatcher.config.poll_interval.as_millis()).unwrap_or(u64::MAX);
    info!(
        workers,
        poll_interval_ms,
        batch_size = dispatcher.config.batch_size,
        "Starting dispatchers"
    );
    (0..workers)
        .map(|_| tokio::spawn(Arc::clone(&dispatcher).run()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityStatus, PipelineTable, PlannerStatus, WorkerKind};
    use crate::queue::TaskFunction;
    use crate::queue::handler::{PassthroughHandler, TaskHandler, handler_fn};
    use crate::queue::registry::FunctionRegistry;
    use crate::store::LibSqlBackend;

    async fn dispatcher_with(handler: Arc<dyn TaskHandler>) -> Dispatcher {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = FunctionRegistry::builder()
            .register_all(TaskFunction::ALL, handler)
            .build();
        let queue = TaskQueue::new(store, Arc::new(registry), Arc::new(PipelineTable::standard()));
        Dispatcher::new(
            Arc::new(queue),
            DispatcherConfig::default(),
            RetryPolicy::immediate(),
        )
    }

    #[tokio::test]
    async fn claim_batch_takes_one_task_per_entity() {
        let dispatcher = dispatcher_with(Arc::new(PassthroughHandler)).await;
        let queue = dispatcher.queue();
        let w1 = queue
            .create_worker(None, WorkerKind::Standard, serde_json::json!({}))
            .await
            .unwrap();
        let w2 = queue
            .create_worker(None, WorkerKind::Standard, serde_json::json!({}))
            .await
            .unwrap();
        for w in [w1.id, w1.id, w2.id] {
            queue
                .enqueue(EntityRef::Worker(w), "worker_initialisation", None, None)
                .await
                .unwrap();
        }

        let batch = dispatcher.claim_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_ne!(batch[0].entity, batch[1].entity);
        assert!(batch.iter().all(|t| t.status == TaskStatus::InProgress));

        assert!(dispatcher.claim_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_follows_pipeline_table() {
        let dispatcher = dispatcher_with(Arc::new(PassthroughHandler)).await;
        let queue = dispatcher.queue();
        let worker = queue
            .create_worker(None, WorkerKind::StructuredData, serde_json::json!({}))
            .await
            .unwrap();
        let entity = EntityRef::Worker(worker.id);
        queue.start_pipeline(entity, None).await.unwrap();

        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.completed, 1);

        let snapshot = queue.get_entity(entity).await.unwrap().unwrap();
        assert_eq!(
            snapshot.status(),
            EntityStatus::Worker(WorkerTaskStatus::InProgress)
        );
        assert_eq!(
            snapshot.next_task(),
            Some(TaskFunction::ExecuteStructuredDataWorker)
        );

        let tasks = queue.entity_tasks(entity).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].function, TaskFunction::ExecuteStructuredDataWorker);
        assert_eq!(tasks[1].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn panic_is_recorded_as_failure() {
        let dispatcher = dispatcher_with(handler_fn(|_ctx: HandlerContext| async move {
            if true {
                panic!("model exploded");
            }
            Ok(HandlerOutcome::stop())
        }))
        .await;
        let queue = dispatcher.queue();
        let planner = queue.create_planner(serde_json::json!({})).await.unwrap();
        let id = queue
            .enqueue(EntityRef::Planner(planner.id), "intake", None, Some(0))
            .await
            .unwrap();

        let batch = dispatcher.claim_batch().await.unwrap();
        let outcome = dispatcher.execute(batch[0].clone()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Exhausted { retry_count: 0 });

        let task = queue.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("model exploded"));
    }

    #[tokio::test]
    async fn backward_entity_transition_fails_the_task() {
        let dispatcher = dispatcher_with(handler_fn(|_ctx: HandlerContext| async move {
            Ok(HandlerOutcome::stop().with_planner_status(PlannerStatus::Received))
        }))
        .await;
        let queue = dispatcher.queue();
        let planner = queue.create_planner(serde_json::json!({})).await.unwrap();
        let entity = EntityRef::Planner(planner.id);

        // Advance the planner first so `received` is a backward move.
        queue.enqueue(entity, "intake", None, Some(1)).await.unwrap();
        let batch = dispatcher.claim_batch().await.unwrap();
        let commit = CompletionCommit {
            entity,
            status: Some(EntityStatus::Planner(PlannerStatus::Routed)),
            state: None,
            next_task: None,
            continuation: None,
            after_workers: None,
        };
        queue
            .store()
            .complete_task(batch[0].task_id, &commit, Utc::now())
            .await
            .unwrap();

        let id = queue.enqueue(entity, "initial_planning", None, Some(1)).await.unwrap();
        let batch = dispatcher.claim_batch().await.unwrap();
        let outcome = dispatcher.execute(batch[0].clone()).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Requeued { retry_count: 1, .. }));

        let task = queue.get_task(id).await.unwrap().unwrap();
        assert!(task.error_message.unwrap().contains("routed -> received"));
        let snapshot = queue.get_entity(entity).await.unwrap().unwrap();
        assert_eq!(snapshot.status(), EntityStatus::Planner(PlannerStatus::Routed));
    }

    #[tokio::test]
    async fn out_of_order_stage_keeps_entity_status() {
        let dispatcher = dispatcher_with(Arc::new(PassthroughHandler)).await;
        let queue = dispatcher.queue();
        let worker = queue
            .create_worker(None, WorkerKind::Standard, serde_json::json!({}))
            .await
            .unwrap();
        let entity = EntityRef::Worker(worker.id);

        // Never initialised, so pending -> completed is not a legal move.
        let id = queue
            .enqueue(entity, "execute_standard_worker", None, Some(0))
            .await
            .unwrap();
        let batch = dispatcher.claim_batch().await.unwrap();
        let outcome = dispatcher.execute(batch[0].clone()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { continuation: None });

        assert_eq!(
            queue.get_task(id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
        let snapshot = queue.get_entity(entity).await.unwrap().unwrap();
        assert_eq!(
            snapshot.status(),
            EntityStatus::Worker(WorkerTaskStatus::Pending)
        );
    }

    #[tokio::test]
    async fn stop_writes_no_continuation() {
        let dispatcher = dispatcher_with(handler_fn(|_ctx: HandlerContext| async move {
            Ok(HandlerOutcome::stop().with_state(serde_json::json!({"done": true})))
        }))
        .await;
        let queue = dispatcher.queue();
        let planner = queue.create_planner(serde_json::json!({})).await.unwrap();
        let entity = EntityRef::Planner(planner.id);
        queue.start_pipeline(entity, None).await.unwrap();

        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(queue.entity_tasks(entity).await.unwrap().len(), 1);

        let snapshot = queue.get_entity(entity).await.unwrap().unwrap();
        assert_eq!(snapshot.next_task(), None);
        assert_eq!(snapshot.state()["done"], true);
        assert_eq!(snapshot.status(), EntityStatus::Planner(PlannerStatus::Routed));
    }

    #[tokio::test]
    async fn inapplicable_continuation_is_rejected() {
        let dispatcher = dispatcher_with(handler_fn(|_ctx: HandlerContext| async move {
            Ok(HandlerOutcome::continue_with(TaskFunction::Synthesis))
        }))
        .await;
        let queue = dispatcher.queue();
        let worker = queue
            .create_worker(None, WorkerKind::Standard, serde_json::json!({}))
            .await
            .unwrap();
        let entity = EntityRef::Worker(worker.id);
        let id = queue.start_pipeline(entity, None).await.unwrap();

        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.requeued, 1);

        let tasks = queue.entity_tasks(entity).await.unwrap();
        assert_eq!(tasks.len(), 1);
        let task = queue.get_task(id).await.unwrap().unwrap();
        assert!(task.error_message.unwrap().starts_with("Continuation rejected"));
        let snapshot = queue.get_entity(entity).await.unwrap().unwrap();
        assert_eq!(snapshot.status(), EntityStatus::Worker(WorkerTaskStatus::Pending));
    }

    #[tokio::test]
    async fn completion_after_reap_is_an_integrity_error() {
        let dispatcher = dispatcher_with(Arc::new(PassthroughHandler)).await;
        let queue = dispatcher.queue();
        let planner = queue.create_planner(serde_json::json!({})).await.unwrap();
        queue
            .start_pipeline(EntityRef::Planner(planner.id), None)
            .await
            .unwrap();

        let batch = dispatcher.claim_batch().await.unwrap();
        let later = Utc::now() + chrono::Duration::hours(1);
        queue
            .store()
            .reset_stale(later, "reaped", later)
            .await
            .unwrap();

        let err = dispatcher.execute(batch[0].clone()).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Integrity(_)));
    }

    #[test]
    fn default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }
}
