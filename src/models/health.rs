use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{Task, TaskStatus};

/// Point-in-time classification of the task population.
///
/// Always computed fresh from the store; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// True iff no task is stalled, failed or long-running.
    pub healthy: bool,
    pub total_tasks: usize,
    pub status_counts: BTreeMap<TaskStatus, usize>,
    /// In progress for longer than the stall timeout.
    pub stalled_tasks: Vec<TaskIssue>,
    /// Failed with retries remaining.
    pub failed_tasks: Vec<TaskIssue>,
    /// Failed with the retry budget spent but not yet marked permanent.
    #[serde(default)]
    pub exhausted_tasks: Vec<TaskIssue>,
    /// In progress past the soft threshold but not yet stalled.
    pub long_running_tasks: Vec<TaskIssue>,
    pub checked_at: DateTime<Utc>,
}

/// A task flagged by the health check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskIssue {
    pub task_id: String,
    /// First 100 characters of the task description.
    pub description: String,
    pub agent: String,
    pub started_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl From<&Task> for TaskIssue {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            description: task.description.chars().take(100).collect(),
            agent: task.assigned_agent.clone(),
            started_at: task.started_at,
            retry_count: task.retry_count,
            error: task.last_error.clone(),
        }
    }
}

/// Aggregate performance figures over all tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total_tasks: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
    pub by_agent: BTreeMap<String, usize>,
    /// Completed tasks over total, 0.0 when there are no tasks.
    pub completion_rate: f64,
    pub average_retry_count: f64,
    pub tasks_with_errors: usize,
}

/// A pending task as seen from an agent's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTask {
    pub task_id: String,
    pub feature_id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Per-agent workload summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWorkload {
    pub agent: String,
    pub total_tasks: usize,
    pub in_progress: usize,
    pub pending: Vec<PendingTask>,
}

/// Result of a failed-task retry sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrySummary {
    /// Tasks moved back to `pending`.
    pub retried: Vec<String>,
    /// Tasks moved to `permanently_failed`.
    pub exhausted: Vec<String>,
}

/// Counts of the actions taken by a full recovery pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecoverySummary {
    /// True when the health check found nothing to do and recovery was skipped.
    pub skipped: bool,
    pub stalled_recovered: Vec<String>,
    pub failed_retried: Vec<String>,
    pub permanently_failed: Vec<String>,
    pub cleaned: usize,
}

impl RecoverySummary {
    pub fn total_actions(&self) -> usize {
        self.stalled_recovered.len()
            + self.failed_retried.len()
            + self.permanently_failed.len()
            + self.cleaned
    }
}
