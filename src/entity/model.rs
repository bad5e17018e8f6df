//! Planner and worker records: the "what stage am I at" half of the pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::queue::TaskFunction;

/// Kind of entity a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Planner,
    Worker,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planner" => Ok(Self::Planner),
            "worker" => Ok(Self::Worker),
            other => Err(ValidationError::UnknownEntityType {
                name: other.to_string(),
            }),
        }
    }
}

/// Typed reference to an entity row.
///
/// The id only has meaning together with its type, so the two travel as one
/// value and are never split into an untyped foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "entity_id", rename_all = "snake_case")]
pub enum EntityRef {
    Planner(Uuid),
    Worker(Uuid),
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: Uuid) -> Self {
        match entity_type {
            EntityType::Planner => Self::Planner(id),
            EntityType::Worker => Self::Worker(id),
        }
    }

    /// Parse an `(entity_type, entity_id)` string pair from the outside world.
    pub fn parse(entity_type: &str, entity_id: &str) -> Result<Self, ValidationError> {
        let entity_type: EntityType = entity_type.parse()?;
        let id = Uuid::parse_str(entity_id).map_err(|_| ValidationError::InvalidEntityId {
            id: entity_id.to_string(),
        })?;
        Ok(Self::new(entity_type, id))
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Planner(_) => EntityType::Planner,
            Self::Worker(_) => EntityType::Worker,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Planner(id) | Self::Worker(id) => *id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type(), self.id())
    }
}

/// Planner lifecycle. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerStatus {
    /// Created from an incoming request, not yet routed.
    Received,
    Routed,
    Planned,
    TasksCreated,
    WorkersInitialised,
    Synthesised,
}

impl PlannerStatus {
    /// Forward moves and self-transitions are allowed; a reaped task that
    /// re-runs may re-apply the status it already wrote.
    pub fn can_transition_to(&self, target: PlannerStatus) -> bool {
        target >= *self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Routed => "routed",
            Self::Planned => "planned",
            Self::TasksCreated => "tasks_created",
            Self::WorkersInitialised => "workers_initialised",
            Self::Synthesised => "synthesised",
        }
    }
}

impl fmt::Display for PlannerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlannerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "routed" => Ok(Self::Routed),
            "planned" => Ok(Self::Planned),
            "tasks_created" => Ok(Self::TasksCreated),
            "workers_initialised" => Ok(Self::WorkersInitialised),
            "synthesised" => Ok(Self::Synthesised),
            other => Err(format!("unknown planner status: {other}")),
        }
    }
}

/// Worker `task_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTaskStatus {
    Pending,
    InProgress,
    Completed,
    FailedValidation,
    Recorded,
}

impl WorkerTaskStatus {
    pub fn can_transition_to(&self, target: WorkerTaskStatus) -> bool {
        use WorkerTaskStatus::*;

        *self == target
            || matches!(
                (self, target),
                (Pending, InProgress)
                    | (InProgress, Completed)
                    | (InProgress, FailedValidation)
                    | (FailedValidation, InProgress)
                    | (Completed, Recorded)
            )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::FailedValidation => "failed_validation",
            Self::Recorded => "recorded",
        }
    }
}

impl fmt::Display for WorkerTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerTaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed_validation" => Ok(Self::FailedValidation),
            "recorded" => Ok(Self::Recorded),
            other => Err(format!("unknown worker task status: {other}")),
        }
    }
}

/// Which execution path a worker takes after initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Standard,
    StructuredData,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::StructuredData => "structured_data",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "structured_data" => Ok(Self::StructuredData),
            other => Err(format!("unknown worker kind: {other}")),
        }
    }
}

/// A persisted planner row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerRecord {
    pub id: Uuid,
    pub status: PlannerStatus,
    /// The operation the pipeline will attempt next, if any.
    pub next_task: Option<TaskFunction>,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlannerRecord {
    pub fn new(state: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: PlannerStatus::Received,
            next_task: None,
            state,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted worker row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub planner_id: Option<Uuid>,
    pub kind: WorkerKind,
    pub task_status: WorkerTaskStatus,
    pub next_task: Option<TaskFunction>,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(planner_id: Option<Uuid>, kind: WorkerKind, state: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            planner_id,
            kind,
            task_status: WorkerTaskStatus::Pending,
            next_task: None,
            state,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Domain status of either entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "status", rename_all = "snake_case")]
pub enum EntityStatus {
    Planner(PlannerStatus),
    Worker(WorkerTaskStatus),
}

impl EntityStatus {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Planner(_) => EntityType::Planner,
            Self::Worker(_) => EntityType::Worker,
        }
    }

    /// Whether moving from `self` to `target` is a legal entity transition.
    /// Statuses of different entity types never transition into each other.
    pub fn can_transition_to(&self, target: EntityStatus) -> bool {
        match (self, target) {
            (Self::Planner(from), Self::Planner(to)) => from.can_transition_to(to),
            (Self::Worker(from), Self::Worker(to)) => from.can_transition_to(to),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner(s) => s.as_str(),
            Self::Worker(s) => s.as_str(),
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of an entity, handed to handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum EntitySnapshot {
    Planner(PlannerRecord),
    Worker(WorkerRecord),
}

impl EntitySnapshot {
    pub fn entity_ref(&self) -> EntityRef {
        match self {
            Self::Planner(p) => EntityRef::Planner(p.id),
            Self::Worker(w) => EntityRef::Worker(w.id),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_ref().entity_type()
    }

    pub fn status(&self) -> EntityStatus {
        match self {
            Self::Planner(p) => EntityStatus::Planner(p.status),
            Self::Worker(w) => EntityStatus::Worker(w.task_status),
        }
    }

    pub fn next_task(&self) -> Option<TaskFunction> {
        match self {
            Self::Planner(p) => p.next_task,
            Self::Worker(w) => w.next_task,
        }
    }

    pub fn state(&self) -> &serde_json::Value {
        match self {
            Self::Planner(p) => &p.state,
            Self::Worker(w) => &w.state,
        }
    }

    /// Worker kind, for branch selection. Planners have none.
    pub fn worker_kind(&self) -> Option<WorkerKind> {
        match self {
            Self::Planner(_) => None,
            Self::Worker(w) => Some(w.kind),
        }
    }

    /// Apply a validated status/state change in memory.
    pub(crate) fn apply(&mut self, status: Option<EntityStatus>, state: Option<&serde_json::Value>) {
        match (&mut *self, status) {
            (Self::Planner(p), Some(EntityStatus::Planner(s))) => p.status = s,
            (Self::Worker(w), Some(EntityStatus::Worker(s))) => w.task_status = s,
            _ => {}
        }
        if let Some(state) = state {
            match self {
                Self::Planner(p) => p.state = state.clone(),
                Self::Worker(w) => w.state = state.clone(),
            }
        }
    }
}

/// Mutation a successful handler asks to persist on its entity row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    /// Overrides the status the pipeline table would assign.
    pub status: Option<EntityStatus>,
    /// Replaces the entity's JSON state document.
    pub state: Option<serde_json::Value>,
}
