use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of a mailbox message.
///
/// `NewTask` and `RecoveredTask` are assignments travelling to an agent;
/// the rest are status reports travelling back to the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    NewTask,
    RecoveredTask,
    StatusUpdate,
    TaskCompleted,
    TaskFailed,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewTask => "new_task",
            Self::RecoveredTask => "recovered_task",
            Self::StatusUpdate => "status_update",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
        }
    }
}

/// A flat mailbox record exchanged between the ledger and agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender: String,
    pub recipient: String,
    pub task_id: String,
    #[serde(default)]
    pub feature_id: Option<String>,
    /// Task description for assignments, result/error/status text for reports.
    #[serde(default)]
    pub content: Option<String>,
    /// Reported progress on `status_update` messages.
    #[serde(default)]
    pub progress: Option<i64>,
    pub timestamp: DateTime<Utc>,
}
