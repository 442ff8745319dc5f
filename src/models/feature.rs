use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{CreateTaskInput, Task};

/// A user-facing unit of work, decomposed into tasks handed to agents.
///
/// `progress` and `status` are derived fields: they are only ever written by
/// the progress aggregator from the current state of the owned tasks. The
/// `tasks` list keeps creation order and is only grown by task creation or
/// pruned by cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    pub id: String,
    pub description: String,
    pub status: FeatureStatus,
    /// Mean progress of the owned tasks, 0–100.
    #[serde(default)]
    pub progress: u8,
    /// Owned task identifiers in creation order.
    #[serde(default)]
    pub tasks: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The aggregate state of a feature.
///
/// - `Pending`: No task has made progress yet
/// - `InProgress`: Some task has progress or is completed, but not all are done
/// - `Completed`: Every owned task is completed
/// - `Failed`: Kept for state documents written by older tooling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the feature still has work outstanding.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// Input for creating a new feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFeatureInput {
    /// Explicit identifier. A UUID is generated when omitted.
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
}

/// A feature together with its decomposed task graph, created in one save.
///
/// This is the shape accepted by `crew plan <file>` and `POST /plans`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturePlan {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<CreateTaskInput>,
}

/// A feature with its resolved tasks, used for progress views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureProgress {
    pub feature: Feature,
    pub tasks: Vec<Task>,
}
