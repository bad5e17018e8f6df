//! Persistence layer: libSQL-backed storage for the task queue and the
//! planner/worker state tables.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CompletionCommit, FailureOutcome, PurgeCounts, QueueStore, Transition};
