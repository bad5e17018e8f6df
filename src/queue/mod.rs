//! Durable task queue.
//!
//! - `function`: closed set of operations a task can name
//! - `state`: task state machine
//! - `model`: queue rows, new-task builder, monitoring stats
//! - `handler`: handler contract and outcomes
//! - `registry`: immutable function → handler map
//! - `retry`: backoff for requeued tasks
//! - `service`: enqueue and status API
//! - `dispatcher`: claim/execute poll loop
//! - `reaper`: stale IN_PROGRESS recovery
//! - `retention`: purge of old terminal tasks

pub mod dispatcher;
pub mod function;
pub mod handler;
pub mod model;
pub mod reaper;
pub mod registry;
pub mod retention;
pub mod retry;
pub mod service;
pub mod state;

pub use dispatcher::{DispatchOutcome, DispatchReport, Dispatcher, DispatcherConfig, spawn_dispatchers};
pub use function::TaskFunction;
pub use handler::{
    Continuation, HandlerContext, HandlerOutcome, PassthroughHandler, TaskHandler, handler_fn,
};
pub use model::{DEFAULT_MAX_RETRIES, NewTask, QueueStats, TaskQueueEntry};
pub use reaper::{ReaperConfig, StaleTaskReaper, spawn_reaper_task};
pub use registry::{FunctionRegistry, FunctionRegistryBuilder};
pub use retention::{RetentionCleaner, RetentionConfig, spawn_retention_task};
pub use retry::RetryPolicy;
pub use service::{DEFAULT_STALE_THRESHOLD, TaskQueue};
pub use state::TaskStatus;
