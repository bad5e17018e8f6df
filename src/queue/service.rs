//! `TaskQueue`: enqueue, entity creation and the status API.
//!
//! Every enqueue is validated against the registry, the pipeline table and
//! the entity table before anything is written.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::function::TaskFunction;
use super::model::{DEFAULT_MAX_RETRIES, NewTask, QueueStats, TaskQueueEntry, cutoff_before};
use super::registry::FunctionRegistry;
use crate::entity::{
    EntityRef, EntitySnapshot, EntityType, PipelineTable, PlannerRecord, WorkerKind, WorkerRecord,
};
use crate::error::{DatabaseError, Error, Result, ValidationError};
use crate::store::QueueStore;

/// Default age after which an IN_PROGRESS task counts as stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    registry: Arc<FunctionRegistry>,
    pipeline: Arc<PipelineTable>,
    default_max_retries: u32,
    stale_threshold: Duration,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<FunctionRegistry>,
        pipeline: Arc<PipelineTable>,
    ) -> Self {
        Self {
            store,
            registry,
            pipeline,
            default_max_retries: DEFAULT_MAX_RETRIES,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<PipelineTable> {
        &self.pipeline
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Whether `function` may be enqueued against an entity of `entity_type`.
    pub fn validate(
        &self,
        entity_type: EntityType,
        function: TaskFunction,
    ) -> std::result::Result<(), ValidationError> {
        if !self.registry.contains(function) {
            return Err(ValidationError::UnknownFunction {
                name: function.to_string(),
            });
        }
        if !self.pipeline.accepts(entity_type, function) {
            return Err(ValidationError::FunctionNotApplicable {
                function,
                entity_type,
            });
        }
        Ok(())
    }

    /// Enqueue by external function name. Returns the new task id.
    ///
    /// Fails with `UnknownFunction` or `EntityNotFound` and writes nothing.
    pub async fn enqueue(
        &self,
        entity: EntityRef,
        function_name: &str,
        payload: Option<serde_json::Value>,
        max_retries: Option<u32>,
    ) -> Result<Uuid> {
        let function = self.registry.resolve(function_name)?;
        self.enqueue_function(entity, function, payload, max_retries)
            .await
    }

    pub async fn enqueue_function(
        &self,
        entity: EntityRef,
        function: TaskFunction,
        payload: Option<serde_json::Value>,
        max_retries: Option<u32>,
    ) -> Result<Uuid> {
        self.validate(entity.entity_type(), function)?;

        let task = NewTask::new(entity, function)
            .with_payload(payload)
            .with_max_retries(max_retries.unwrap_or(self.default_max_retries));

        self.store
            .insert_task(&task, Utc::now())
            .await
            .map_err(|e| entity_not_found(e, entity))?;

        tracing::info!(
            task_id = %task.task_id,
            entity = %entity,
            function = %function,
            max_retries = task.max_retries,
            "Task enqueued"
        );
        Ok(task.task_id)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskQueueEntry>> {
        Ok(self.store.get_task(task_id).await?)
    }

    /// Queue history of one entity, oldest first.
    pub async fn entity_tasks(&self, entity: EntityRef) -> Result<Vec<TaskQueueEntry>> {
        Ok(self.store.list_entity_tasks(entity).await?)
    }

    pub async fn get_entity(&self, entity: EntityRef) -> Result<Option<EntitySnapshot>> {
        Ok(self.store.get_entity(entity).await?)
    }

    pub async fn planner_workers(&self, planner_id: Uuid) -> Result<Vec<WorkerRecord>> {
        Ok(self.store.list_workers(planner_id).await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue_stats_at(Utc::now()).await
    }

    pub async fn queue_stats_at(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let cutoff = cutoff_before(now, self.stale_threshold);
        Ok(self.store.queue_stats(cutoff, now).await?)
    }

    pub async fn create_planner(&self, state: serde_json::Value) -> Result<PlannerRecord> {
        let planner = PlannerRecord::new(state);
        self.store.insert_planner(&planner).await?;
        tracing::info!(planner_id = %planner.id, "Planner created");
        Ok(planner)
    }

    pub async fn create_worker(
        &self,
        planner_id: Option<Uuid>,
        kind: WorkerKind,
        state: serde_json::Value,
    ) -> Result<WorkerRecord> {
        let worker = WorkerRecord::new(planner_id, kind, state);
        self.store.insert_worker(&worker).await.map_err(|e| match planner_id {
            Some(id) => entity_not_found(e, EntityRef::Planner(id)),
            None => e.into(),
        })?;
        tracing::info!(worker_id = %worker.id, kind = %kind, "Worker created");
        Ok(worker)
    }

    /// Enqueue the first stage of the entity's pipeline.
    pub async fn start_pipeline(
        &self,
        entity: EntityRef,
        payload: Option<serde_json::Value>,
    ) -> Result<Uuid> {
        let entity_type = entity.entity_type();
        let function = self.pipeline.entry_function(entity_type).ok_or(
            ValidationError::UnknownFunction {
                name: format!("<entry stage for {entity_type}>"),
            },
        )?;
        self.enqueue_function(entity, function, payload, None).await
    }
}

fn entity_not_found(err: DatabaseError, entity: EntityRef) -> Error {
    match err {
        DatabaseError::NotFound { .. } => ValidationError::EntityNotFound {
            entity_type: entity.entity_type(),
            id: entity.id(),
        }
        .into(),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handler::PassthroughHandler;
    use crate::queue::TaskStatus;
    use crate::store::LibSqlBackend;

    async fn queue_with(functions: &[TaskFunction]) -> TaskQueue {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = FunctionRegistry::builder()
            .register_all(functions.iter().copied(), Arc::new(PassthroughHandler))
            .build();
        TaskQueue::new(store, Arc::new(registry), Arc::new(PipelineTable::standard()))
    }

    #[tokio::test]
    async fn enqueue_creates_pending_task() {
        let queue = queue_with(&TaskFunction::ALL).await;
        let planner = queue.create_planner(serde_json::json!({})).await.unwrap();
        let entity = EntityRef::Planner(planner.id);

        let id = queue
            .enqueue(entity, "initial_planning", Some(serde_json::json!({"x": 1})), Some(2))
            .await
            .unwrap();

        let task = queue.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.function, TaskFunction::InitialPlanning);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 2);
    }

    #[tokio::test]
    async fn default_max_retries_applies() {
        let queue = queue_with(&TaskFunction::ALL)
            .await
            .with_default_max_retries(5);
        let planner = queue.create_planner(serde_json::json!({})).await.unwrap();
        let id = queue
            .enqueue(EntityRef::Planner(planner.id), "intake", None, None)
            .await
            .unwrap();
        assert_eq!(queue.get_task(id).await.unwrap().unwrap().max_retries, 5);
    }

    #[tokio::test]
    async fn unregistered_function_is_rejected() {
        let queue = queue_with(&[TaskFunction::Intake]).await;
        let planner = queue.create_planner(serde_json::json!({})).await.unwrap();
        let entity = EntityRef::Planner(planner.id);

        for name in ["synthesis", "make_coffee"] {
            let err = queue.enqueue(entity, name, None, None).await.unwrap_err();
            assert!(matches!(
                err,
                Error::Validation(ValidationError::UnknownFunction { .. })
            ));
        }
        assert!(queue.entity_tasks(entity).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_entity_is_rejected() {
        let queue = queue_with(&TaskFunction::ALL).await;
        let ghost = EntityRef::Worker(Uuid::new_v4());
        let err = queue
            .enqueue(ghost, "execute_standard_worker", None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::EntityNotFound { entity_type: EntityType::Worker, .. })
        ));
        assert_eq!(queue.queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn function_must_apply_to_entity_type() {
        let queue = queue_with(&TaskFunction::ALL).await;
        let worker = queue
            .create_worker(None, WorkerKind::Standard, serde_json::json!({}))
            .await
            .unwrap();
        let err = queue
            .enqueue(EntityRef::Worker(worker.id), "synthesis", None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::FunctionNotApplicable { .. })
        ));
    }

    #[tokio::test]
    async fn start_pipeline_enqueues_entry_stage() {
        let queue = queue_with(&TaskFunction::ALL).await;
        let worker = queue
            .create_worker(None, WorkerKind::StructuredData, serde_json::json!({}))
            .await
            .unwrap();
        let id = queue
            .start_pipeline(EntityRef::Worker(worker.id), None)
            .await
            .unwrap();
        let task = queue.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.function, TaskFunction::WorkerInitialisation);
    }

    #[tokio::test]
    async fn worker_for_missing_planner_is_rejected() {
        let queue = queue_with(&TaskFunction::ALL).await;
        let err = queue
            .create_worker(Some(Uuid::new_v4()), WorkerKind::Standard, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::EntityNotFound { entity_type: EntityType::Planner, .. })
        ));
    }
}
