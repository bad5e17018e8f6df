//! Error types for the pipeline queue.

use uuid::Uuid;

use crate::entity::EntityType;
use crate::queue::{TaskFunction, TaskStatus};

/// Top-level error type for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Enqueue-time rejections. Nothing is written when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("Unknown entity type: {name}")]
    UnknownEntityType { name: String },

    #[error("Invalid entity id: {id}")]
    InvalidEntityId { id: String },

    #[error("Entity not found: {entity_type} {id}")]
    EntityNotFound { entity_type: EntityType, id: Uuid },

    #[error("Function {function} does not apply to {entity_type} entities")]
    FunctionNotApplicable {
        function: TaskFunction,
        entity_type: EntityType,
    },
}

/// Failure raised by a registered handler (or while committing its outcome).
///
/// Captured into the task's `error_message`; never propagated to the enqueuer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Upstream call failed: {0}")]
    Upstream(String),

    #[error("Entity {entity} vanished before the handler ran")]
    EntityMissing { entity: String },

    #[error("Invalid entity transition for {entity}: {from} -> {to}")]
    InvalidEntityTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Continuation rejected: {0}")]
    ContinuationRejected(String),

    #[error("No handler registered for {function}")]
    NotRegistered { function: TaskFunction },

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Shorthand for a plain failure message.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// A task transition was attempted from a state it was not in.
///
/// Should never occur while the conditional updates hold; treated as a
/// programming-invariant violation and logged at error level.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("Task {task_id} expected in {expected}, found {found}")]
    UnexpectedState {
        task_id: Uuid,
        expected: TaskStatus,
        found: String,
    },
}

impl IntegrityError {
    pub(crate) fn unexpected(task_id: Uuid, expected: TaskStatus, found: Option<TaskStatus>) -> Self {
        Self::UnexpectedState {
            task_id,
            expected,
            found: found.map_or_else(|| "no row".to_string(), |s| s.to_string()),
        }
    }
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
