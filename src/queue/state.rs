//! Task state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// State of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a dispatcher; holds its entity's exclusion.
    InProgress,
    /// Handler succeeded.
    Completed,
    /// Handler failed. Terminal once retries are exhausted.
    Failed,
}

impl TaskStatus {
    /// Whether a task in this state may move to `target`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // Claim
            (Pending, InProgress) |
            // Outcome, or stale reset by the reaper
            (InProgress, Completed) | (InProgress, Failed) | (InProgress, Pending) |
            // Requeue (only while retries remain)
            (Failed, Pending)
        )
    }

    /// Terminal here means no transition can follow without a retry budget:
    /// `Completed` always, `Failed` once retries are exhausted.
    pub fn is_terminal(&self, retry_count: u32, max_retries: u32) -> bool {
        match self {
            Self::Completed => true,
            Self::Failed => retry_count >= max_retries,
            Self::Pending | Self::InProgress => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}
