//! Pipeline transition table.
//!
//! The intake → planning → execution → synthesis chain as data: for each
//! entity type, which functions apply, what status a successful run leaves
//! the entity in, and which function follows. Handlers may override the
//! follow-up, but the default path lives here and nowhere else.

use std::collections::HashMap;

use super::model::{
    EntitySnapshot, EntityStatus, EntityType, PlannerStatus, WorkerKind, WorkerTaskStatus,
};
use crate::queue::TaskFunction;

/// What follows a successfully completed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStage {
    /// Always continue with this function.
    Function(TaskFunction),
    /// Continue with this function once every worker owned by the planner
    /// has finished. Planner rules only.
    AfterWorkers(TaskFunction),
    /// Choose by the worker's kind.
    ByWorkerKind {
        standard: TaskFunction,
        structured_data: TaskFunction,
    },
    /// End of the chain for this entity.
    End,
}

/// One row of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRule {
    pub function: TaskFunction,
    /// Status the entity takes when this stage succeeds.
    pub on_success: EntityStatus,
    pub next: NextStage,
}

/// Stage rules keyed by `(entity type, function)`.
#[derive(Debug, Clone)]
pub struct PipelineTable {
    rules: HashMap<(EntityType, TaskFunction), StageRule>,
    entry: HashMap<EntityType, TaskFunction>,
}

impl PipelineTable {
    /// An empty table; every function is rejected until rules are added.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            entry: HashMap::new(),
        }
    }

    /// The standard planner and worker chains.
    pub fn standard() -> Self {
        use TaskFunction::*;

        let planner = EntityStatus::Planner;
        let worker = EntityStatus::Worker;

        Self::empty()
            .with_entry(EntityType::Planner, Intake)
            .with_rule(
                EntityType::Planner,
                StageRule {
                    function: Intake,
                    on_success: planner(PlannerStatus::Routed),
                    next: NextStage::Function(InitialPlanning),
                },
            )
            .with_rule(
                EntityType::Planner,
                StageRule {
                    function: InitialPlanning,
                    on_success: planner(PlannerStatus::Planned),
                    next: NextStage::Function(TaskCreation),
                },
            )
            .with_rule(
                EntityType::Planner,
                StageRule {
                    function: TaskCreation,
                    on_success: planner(PlannerStatus::TasksCreated),
                    next: NextStage::Function(WorkerInitialisation),
                },
            )
            .with_rule(
                EntityType::Planner,
                StageRule {
                    function: WorkerInitialisation,
                    on_success: planner(PlannerStatus::WorkersInitialised),
                    next: NextStage::AfterWorkers(Synthesis),
                },
            )
            .with_rule(
                EntityType::Planner,
                StageRule {
                    function: Synthesis,
                    on_success: planner(PlannerStatus::Synthesised),
                    next: NextStage::End,
                },
            )
            .with_entry(EntityType::Worker, WorkerInitialisation)
            .with_rule(
                EntityType::Worker,
                StageRule {
                    function: WorkerInitialisation,
                    on_success: worker(WorkerTaskStatus::InProgress),
                    next: NextStage::ByWorkerKind {
                        standard: ExecuteStandardWorker,
                        structured_data: ExecuteStructuredDataWorker,
                    },
                },
            )
            .with_rule(
                EntityType::Worker,
                StageRule {
                    function: ExecuteStandardWorker,
                    on_success: worker(WorkerTaskStatus::Completed),
                    next: NextStage::End,
                },
            )
            .with_rule(
                EntityType::Worker,
                StageRule {
                    function: ExecuteStructuredDataWorker,
                    on_success: worker(WorkerTaskStatus::Completed),
                    next: NextStage::End,
                },
            )
    }

    pub fn with_rule(mut self, entity_type: EntityType, rule: StageRule) -> Self {
        self.rules.insert((entity_type, rule.function), rule);
        self
    }

    pub fn with_entry(mut self, entity_type: EntityType, function: TaskFunction) -> Self {
        self.entry.insert(entity_type, function);
        self
    }

    /// Whether `function` may be enqueued against an entity of this type.
    pub fn accepts(&self, entity_type: EntityType, function: TaskFunction) -> bool {
        self.rules.contains_key(&(entity_type, function))
    }

    pub fn rule(&self, entity_type: EntityType, function: TaskFunction) -> Option<&StageRule> {
        self.rules.get(&(entity_type, function))
    }

    /// First stage of a fresh entity of this type.
    pub fn entry_function(&self, entity_type: EntityType) -> Option<TaskFunction> {
        self.entry.get(&entity_type).copied()
    }

    /// Whether the follow-up of `completed` waits for the planner's workers.
    pub fn waits_for_workers(&self, entity_type: EntityType, completed: TaskFunction) -> bool {
        matches!(
            self.rule(entity_type, completed).map(|r| r.next),
            Some(NextStage::AfterWorkers(_))
        )
    }

    /// Planner stage that finishing workers may release.
    pub fn worker_gated_stage(&self) -> Option<TaskFunction> {
        self.rules
            .iter()
            .filter(|((entity_type, _), _)| *entity_type == EntityType::Planner)
            .find_map(|(_, rule)| match rule.next {
                NextStage::AfterWorkers(f) => Some(f),
                _ => None,
            })
    }

    /// Follow-up for `completed` given the entity as it will be after commit.
    ///
    /// For a worker-gated stage this is the function the entity waits on.
    pub fn next_function(
        &self,
        snapshot: &EntitySnapshot,
        completed: TaskFunction,
    ) -> Option<TaskFunction> {
        let rule = self.rule(snapshot.entity_type(), completed)?;
        match rule.next {
            NextStage::Function(f) | NextStage::AfterWorkers(f) => Some(f),
            NextStage::ByWorkerKind {
                standard,
                structured_data,
            } => match snapshot.worker_kind()? {
                WorkerKind::Standard => Some(standard),
                WorkerKind::StructuredData => Some(structured_data),
            },
            NextStage::End => None,
        }
    }
}

impl Default for PipelineTable {
    fn default() -> Self {
        Self::standard()
    }
}
