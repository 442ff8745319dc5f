use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The smallest unit of assignable work, owned by one feature and one agent.
///
/// Status, progress and retry bookkeeping are owned by the lifecycle manager;
/// nothing else should write them directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub feature_id: String,
    /// Description of the work handed to the agent.
    pub description: String,
    /// Identifier of the agent this task is assigned to (e.g. `frontend`).
    pub assigned_agent: String,
    pub status: TaskStatus,
    /// Reported progress, always within 0–100.
    #[serde(default)]
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on the first transition to `in_progress`, cleared on requeue.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Result payload reported with completion.
    #[serde(default)]
    pub result: Option<String>,
}

impl Task {
    /// The instant used to judge how long the task has been running.
    ///
    /// Records loaded from older state documents may be `in_progress`
    /// without a `started_at`; those fall back to their last update.
    pub fn running_since(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.updated_at)
    }
}

/// The execution status of a task.
///
/// - `Pending`: Waiting to be dispatched
/// - `InProgress`: An agent is working on it
/// - `Completed`: Finished successfully (terminal)
/// - `Failed`: Failed, eligible for retry
/// - `PermanentlyFailed`: Retry budget exhausted (terminal)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    PermanentlyFailed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "permanently_failed" | "failed_permanently" => Some(Self::PermanentlyFailed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PermanentlyFailed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Input for creating a task under a feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskInput {
    /// Explicit identifier. A UUID is generated when omitted.
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    /// The agent to assign this task to.
    pub agent: String,
}

/// Progress report from an agent. Values outside 0–100 are clamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressInput {
    pub progress: i64,
    #[serde(default)]
    pub message: Option<String>,
}

/// Completion report from an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteTaskInput {
    #[serde(default)]
    pub result: Option<String>,
}

/// Failure report from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailTaskInput {
    pub error: String,
}

/// The result of asking the lifecycle manager for a transition.
///
/// Agent reports may be duplicated or arrive out of order, so a request
/// that does not apply to the task's current status is `Ignored` rather
/// than an error. Unknown task ids are `NotFound`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied(Task),
    Ignored { task: Task, reason: String },
    NotFound,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn task(&self) -> Option<&Task> {
        match self {
            Self::Applied(task) | Self::Ignored { task, .. } => Some(task),
            Self::NotFound => None,
        }
    }
}
