//! Handler contract for registered functions.
//!
//! A handler receives the entity snapshot and the task payload, and either
//! succeeds with an [`HandlerOutcome`] or fails with a [`HandlerError`].
//! Handlers must tolerate being re-invoked for the same task: a task reaped
//! after a crash runs again from the start.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::function::TaskFunction;
use crate::entity::{EntityPatch, EntitySnapshot, EntityStatus, PlannerStatus, WorkerTaskStatus};
use crate::error::HandlerError;

/// Everything a handler gets to see.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task_id: Uuid,
    pub function: TaskFunction,
    pub entity: EntitySnapshot,
    pub payload: Option<serde_json::Value>,
    /// Prior failed attempts of this task.
    pub retry_count: u32,
}

/// Which follow-up, if any, to enqueue on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Continuation {
    /// Whatever the pipeline table says comes next.
    #[default]
    Pipeline,
    /// A specific stage, overriding the table.
    Stage(TaskFunction),
    /// Do not continue.
    Stop,
}

/// Successful result of a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    pub patch: EntityPatch,
    pub continuation: Continuation,
    /// Payload for the follow-up task.
    pub next_payload: Option<serde_json::Value>,
}

impl HandlerOutcome {
    /// Follow the pipeline table.
    pub fn advance() -> Self {
        Self::default()
    }

    /// Succeed without enqueuing anything.
    pub fn stop() -> Self {
        Self {
            continuation: Continuation::Stop,
            ..Self::default()
        }
    }

    /// Succeed and continue with `function`.
    pub fn continue_with(function: TaskFunction) -> Self {
        Self {
            continuation: Continuation::Stage(function),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.patch.state = Some(state);
        self
    }

    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.patch.status = Some(status);
        self
    }

    pub fn with_planner_status(self, status: PlannerStatus) -> Self {
        self.with_status(EntityStatus::Planner(status))
    }

    pub fn with_worker_status(self, status: WorkerTaskStatus) -> Self {
        self.with_status(EntityStatus::Worker(status))
    }

    pub fn with_next_payload(mut self, payload: serde_json::Value) -> Self {
        self.next_payload = Some(payload);
        self
    }
}

/// A compiled handler for one or more functions.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, HandlerError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F, Fut>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutcome, HandlerError>> + Send,
{
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, HandlerError> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}

/// Development handler: stores the payload under the function's name in the
/// entity state and follows the pipeline table.
pub struct PassthroughHandler;

#[async_trait]
impl TaskHandler for PassthroughHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, HandlerError> {
        let mut state = match ctx.entity.state() {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(HandlerError::InvalidPayload(format!(
                    "entity state must be an object, got {other}"
                )));
            }
        };
        state.insert(
            ctx.function.to_string(),
            ctx.payload.clone().unwrap_or(serde_json::Value::Null),
        );

        tracing::debug!(
            task_id = %ctx.task_id,
            entity = %ctx.entity.entity_ref(),
            function = %ctx.function,
            "Passthrough handler advanced entity"
        );

        Ok(HandlerOutcome::advance().with_state(serde_json::Value::Object(state)))
    }
}
