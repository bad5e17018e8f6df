//! Closed set of pipeline operations a task can name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A known pipeline operation. Persisted as its snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFunction {
    /// Route an incoming request to a planner.
    Intake,
    InitialPlanning,
    TaskCreation,
    WorkerInitialisation,
    ExecuteStandardWorker,
    ExecuteStructuredDataWorker,
    Synthesis,
}

impl TaskFunction {
    pub const ALL: [TaskFunction; 7] = [
        Self::Intake,
        Self::InitialPlanning,
        Self::TaskCreation,
        Self::WorkerInitialisation,
        Self::ExecuteStandardWorker,
        Self::ExecuteStructuredDataWorker,
        Self::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::InitialPlanning => "initial_planning",
            Self::TaskCreation => "task_creation",
            Self::WorkerInitialisation => "worker_initialisation",
            Self::ExecuteStandardWorker => "execute_standard_worker",
            Self::ExecuteStructuredDataWorker => "execute_structured_data_worker",
            Self::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskFunction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownFunction {
                name: s.to_string(),
            })
    }
}
