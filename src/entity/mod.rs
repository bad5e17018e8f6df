//! Entities whose multi-stage execution the queue drives.
//!
//! - `model`: planner/worker records, typed references, status enums
//! - `pipeline`: per-entity-type stage transition table

pub mod model;
pub mod pipeline;

pub use model::{
    EntityPatch, EntityRef, EntitySnapshot, EntityStatus, EntityType, PlannerRecord,
    PlannerStatus, WorkerKind, WorkerRecord, WorkerTaskStatus,
};
pub use pipeline::{NextStage, PipelineTable, StageRule};
