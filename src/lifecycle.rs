//! Task lifecycle state machine.
//!
//! ```text
//! pending ──start/progress──► in_progress ──complete──► completed
//!    ▲                            │
//!    │ requeue (stall)            └──fail──► failed ──retry──► pending
//!    └────────────────────────────────────────┘  │
//!                                                └─(budget spent)─► permanently_failed
//! ```
//!
//! Every status, progress or retry mutation goes through [`TaskLifecycle`].
//! Each call is one read-snapshot / mutate / write-snapshot cycle, and the
//! owning feature is re-aggregated in the same snapshot before it is saved.
//!
//! Agent reports are delivered at least once and in no particular order, so
//! a report that does not apply to the task's current status is ignored
//! rather than rejected. Only a retry requested for a task that has not
//! failed is treated as a caller bug.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::models::*;
use crate::progress::recompute_feature;
use crate::store::{Snapshot, StateStore};

/// Default number of retries before a task is permanently failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Bounds on how often a failed task may be re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// A requested change to a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskAction {
    Start,
    /// Caller-supplied progress; clamped into 0–100.
    Progress(i64),
    Complete { result: Option<String> },
    Fail { error: String },
    /// Re-queue a failed task, bounded by `max_retries`.
    Retry { max_retries: u32 },
    /// Put an abandoned in-progress task back in the queue.
    Requeue { reason: String },
}

impl TaskAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress(_) => "update progress of",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::Retry { .. } => "retry",
            Self::Requeue { .. } => "requeue",
        }
    }
}

/// What [`apply_action`] did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Applied,
    Ignored(&'static str),
}

/// Clamp a caller-supplied percentage into 0–100.
pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

/// Apply one action to a task record.
///
/// The task is only modified when the result is [`Step::Applied`].
pub fn apply_action(
    task: &mut Task,
    action: &TaskAction,
    policy: RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Step> {
    use TaskStatus::*;

    let step = match (task.status, action) {
        (Pending, TaskAction::Start) => {
            task.status = InProgress;
            task.started_at.get_or_insert(now);
            Step::Applied
        }
        (InProgress, TaskAction::Start) => Step::Ignored("already in progress"),

        (Pending | InProgress, TaskAction::Progress(value)) => {
            task.status = InProgress;
            task.started_at.get_or_insert(now);
            task.progress = clamp_progress(*value);
            Step::Applied
        }

        (Pending | InProgress | Failed, TaskAction::Complete { result }) => {
            task.status = Completed;
            task.started_at.get_or_insert(now);
            task.progress = 100;
            task.last_error = None;
            if result.is_some() {
                task.result = result.clone();
            }
            Step::Applied
        }
        (Completed, TaskAction::Complete { .. }) => Step::Ignored("already completed"),

        (Pending | InProgress, TaskAction::Fail { error }) => {
            task.last_error = Some(error.clone());
            task.status = if task.retry_count >= policy.max_retries {
                PermanentlyFailed
            } else {
                Failed
            };
            Step::Applied
        }
        (Failed, TaskAction::Fail { .. }) => Step::Ignored("already failed"),

        (Failed, TaskAction::Retry { max_retries }) => {
            if task.retry_count < *max_retries {
                task.retry_count += 1;
                task.status = Pending;
                task.started_at = None;
                task.progress = 0;
            } else {
                task.status = PermanentlyFailed;
            }
            Step::Applied
        }
        (PermanentlyFailed, TaskAction::Retry { .. }) => Step::Ignored("retry budget exhausted"),
        (Pending | InProgress | Completed, TaskAction::Retry { .. }) => {
            return Err(LedgerError::InvalidTransition {
                task_id: task.id.clone(),
                from: task.status,
                action: action.name(),
            });
        }

        (InProgress, TaskAction::Requeue { reason }) => {
            task.status = Pending;
            task.started_at = None;
            task.progress = 0;
            task.last_error = Some(reason.clone());
            Step::Applied
        }
        (_, TaskAction::Requeue { .. }) => Step::Ignored("not in progress"),

        (Failed, _) => Step::Ignored("task failed and awaits retry"),
        (Completed | PermanentlyFailed, _) => Step::Ignored("task is terminal"),
    };

    if step == Step::Applied {
        task.updated_at = now;
    }
    Ok(step)
}

/// The authoritative owner of task state transitions.
///
/// Cloning shares the store and the in-process write lock, so clones handed
/// to the dispatcher, the recovery engine and the HTTP layer serialize their
/// read-modify-write cycles against each other. Separate processes sharing a
/// backing store are last-writer-wins at snapshot granularity.
#[derive(Clone)]
pub struct TaskLifecycle {
    store: Arc<dyn StateStore>,
    policy: RetryPolicy,
    write_lock: Arc<Mutex<()>>,
}

impl TaskLifecycle {
    pub fn new(store: Arc<dyn StateStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.load()
    }

    /// Run one read-modify-write cycle under the write lock.
    ///
    /// The closure returns its result and whether the snapshot changed; the
    /// snapshot is only written back when it did.
    pub(crate) fn update<R>(
        &self,
        f: impl FnOnce(&mut Snapshot, DateTime<Utc>) -> Result<(R, bool)>,
    ) -> Result<R> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshot = self.store.load();
        let (out, dirty) = f(&mut snapshot, Utc::now())?;
        if dirty {
            self.store.save(&snapshot)?;
        }
        Ok(out)
    }

    /// Apply an action inside an open snapshot, re-aggregating the feature.
    pub(crate) fn transition_in(
        &self,
        snapshot: &mut Snapshot,
        task_id: &str,
        action: &TaskAction,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let Some(task) = snapshot.tasks.get_mut(task_id) else {
            tracing::debug!("Ignoring {} for unknown task {}", action.name(), task_id);
            return Ok(TransitionOutcome::NotFound);
        };

        let from = task.status;
        match apply_action(task, action, self.policy, now)? {
            Step::Applied => {
                let task = task.clone();
                recompute_feature(snapshot, &task.feature_id, now);
                tracing::info!(
                    task_id = %task.id,
                    agent = %task.assigned_agent,
                    "Task {} -> {} ({}%)",
                    from,
                    task.status,
                    task.progress
                );
                Ok(TransitionOutcome::Applied(task))
            }
            Step::Ignored(reason) => {
                tracing::debug!(task_id = %task.id, "Ignored {}: {}", action.name(), reason);
                Ok(TransitionOutcome::Ignored {
                    task: task.clone(),
                    reason: reason.to_string(),
                })
            }
        }
    }

    pub fn transition(&self, task_id: &str, action: TaskAction) -> Result<TransitionOutcome> {
        self.update(|snapshot, now| {
            let outcome = self.transition_in(snapshot, task_id, &action, now)?;
            let dirty = outcome.is_applied();
            Ok((outcome, dirty))
        })
    }

    // ============================================================
    // Transitions
    // ============================================================

    pub fn start(&self, task_id: &str) -> Result<TransitionOutcome> {
        self.transition(task_id, TaskAction::Start)
    }

    pub fn update_progress(&self, task_id: &str, progress: i64) -> Result<TransitionOutcome> {
        self.transition(task_id, TaskAction::Progress(progress))
    }

    pub fn complete(&self, task_id: &str, result: Option<String>) -> Result<TransitionOutcome> {
        self.transition(task_id, TaskAction::Complete { result })
    }

    pub fn fail(&self, task_id: &str, error: impl Into<String>) -> Result<TransitionOutcome> {
        self.transition(
            task_id,
            TaskAction::Fail {
                error: error.into(),
            },
        )
    }

    pub fn retry(&self, task_id: &str) -> Result<TransitionOutcome> {
        self.transition(
            task_id,
            TaskAction::Retry {
                max_retries: self.policy.max_retries,
            },
        )
    }

    pub fn requeue(&self, task_id: &str, reason: impl Into<String>) -> Result<TransitionOutcome> {
        self.transition(
            task_id,
            TaskAction::Requeue {
                reason: reason.into(),
            },
        )
    }

    // ============================================================
    // Creation
    // ============================================================

    pub fn create_feature(&self, input: CreateFeatureInput) -> Result<Feature> {
        self.update(|snapshot, now| {
            let feature = insert_feature(snapshot, input, now)?;
            Ok((feature, true))
        })
    }

    pub fn create_task(&self, feature_id: &str, input: CreateTaskInput) -> Result<Task> {
        self.update(|snapshot, now| {
            let task = insert_task(snapshot, feature_id, input, now)?;
            Ok((task, true))
        })
    }

    /// Create a feature and its whole task graph in a single save.
    ///
    /// Nothing is written if any part of the plan is rejected.
    pub fn create_plan(&self, plan: FeaturePlan) -> Result<FeatureProgress> {
        self.update(|snapshot, now| {
            let feature = insert_feature(
                snapshot,
                CreateFeatureInput {
                    id: plan.id,
                    description: plan.description,
                },
                now,
            )?;
            let mut tasks = Vec::with_capacity(plan.tasks.len());
            for input in plan.tasks {
                tasks.push(insert_task(snapshot, &feature.id, input, now)?);
            }
            let feature = snapshot
                .features
                .get(&feature.id)
                .cloned()
                .ok_or_else(|| LedgerError::FeatureNotFound(feature.id.clone()))?;
            Ok((FeatureProgress { feature, tasks }, true))
        })
    }

    /// Wipe all features and tasks.
    pub fn reset(&self) -> Result<()> {
        self.update(|snapshot, _| {
            let removed = snapshot.tasks.len();
            *snapshot = Snapshot::default();
            tracing::warn!("Ledger reset, {} tasks removed", removed);
            Ok(((), true))
        })
    }

    // ============================================================
    // Queries
    // ============================================================

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.store.get_task(id)
    }

    pub fn get_feature(&self, id: &str) -> Option<Feature> {
        self.store.get_feature(id)
    }

    pub fn feature_progress(&self, id: &str) -> Option<FeatureProgress> {
        let snapshot = self.store.load();
        feature_progress_in(&snapshot, id)
    }

    /// All features with their tasks, newest first.
    pub fn list_features(&self) -> Vec<FeatureProgress> {
        let snapshot = self.store.load();
        let mut features: Vec<_> = snapshot
            .features
            .keys()
            .filter_map(|id| feature_progress_in(&snapshot, id))
            .collect();
        features.sort_by(|a, b| b.feature.created_at.cmp(&a.feature.created_at));
        features
    }

    /// Tasks, optionally filtered by status, oldest first.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<_> = self
            .store
            .load()
            .tasks
            .into_values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// `(active, total)` feature counts.
    pub fn active_features_count(&self) -> (usize, usize) {
        let snapshot = self.store.load();
        let active = snapshot
            .features
            .values()
            .filter(|f| f.status.is_active())
            .count();
        (active, snapshot.features.len())
    }
}

fn feature_progress_in(snapshot: &Snapshot, id: &str) -> Option<FeatureProgress> {
    let feature = snapshot.features.get(id)?.clone();
    let tasks = snapshot.feature_tasks(id).into_iter().cloned().collect();
    Some(FeatureProgress { feature, tasks })
}

fn new_id(requested: Option<String>) -> String {
    requested
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn insert_feature(
    snapshot: &mut Snapshot,
    input: CreateFeatureInput,
    now: DateTime<Utc>,
) -> Result<Feature> {
    let id = new_id(input.id);
    if snapshot.features.contains_key(&id) {
        return Err(LedgerError::DuplicateFeature(id));
    }

    let feature = Feature {
        id: id.clone(),
        description: input.description,
        status: FeatureStatus::Pending,
        progress: 0,
        tasks: Vec::new(),
        created_at: now,
        updated_at: now,
    };
    snapshot.features.insert(id, feature.clone());
    tracing::info!(feature_id = %feature.id, "Feature created");
    Ok(feature)
}

fn insert_task(
    snapshot: &mut Snapshot,
    feature_id: &str,
    input: CreateTaskInput,
    now: DateTime<Utc>,
) -> Result<Task> {
    if !snapshot.features.contains_key(feature_id) {
        return Err(LedgerError::FeatureNotFound(feature_id.to_string()));
    }
    let agent = AgentKind::from_str(&input.agent)
        .filter(AgentKind::is_worker)
        .ok_or_else(|| LedgerError::InvalidAgent(input.agent.clone()))?;

    let id = new_id(input.id);
    if snapshot.tasks.contains_key(&id) {
        return Err(LedgerError::DuplicateTask(id));
    }

    let task = Task {
        id: id.clone(),
        feature_id: feature_id.to_string(),
        description: input.description,
        assigned_agent: agent.as_str().to_string(),
        status: TaskStatus::Pending,
        progress: 0,
        created_at: now,
        updated_at: now,
        started_at: None,
        retry_count: 0,
        last_error: None,
        result: None,
    };
    snapshot.tasks.insert(id.clone(), task.clone());
    if let Some(feature) = snapshot.features.get_mut(feature_id) {
        feature.tasks.push(id);
    }
    recompute_feature(snapshot, feature_id, now);

    tracing::info!(
        task_id = %task.id,
        feature_id = %feature_id,
        agent = %task.assigned_agent,
        "Task created"
    );
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: "T1".to_string(),
            feature_id: "F1".to_string(),
            description: "build the login form".to_string(),
            assigned_agent: "frontend".to_string(),
            status,
            progress: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            retry_count: 0,
            last_error: None,
            result: None,
        }
    }

    fn apply(t: &mut Task, action: TaskAction) -> Step {
        apply_action(t, &action, RetryPolicy::default(), Utc::now()).unwrap()
    }

    #[test]
    fn test_clamp_progress() {
        assert_eq!(clamp_progress(-20), 0);
        assert_eq!(clamp_progress(42), 42);
        assert_eq!(clamp_progress(250), 100);
    }

    #[test]
    fn test_start_sets_started_at_once() {
        let mut t = task(TaskStatus::Pending);
        assert_eq!(apply(&mut t, TaskAction::Start), Step::Applied);
        let started = t.started_at.unwrap();

        assert_eq!(
            apply(&mut t, TaskAction::Start),
            Step::Ignored("already in progress")
        );
        assert_eq!(t.started_at, Some(started));
    }

    #[test]
    fn test_progress_on_pending_starts_task() {
        let mut t = task(TaskStatus::Pending);
        assert_eq!(apply(&mut t, TaskAction::Progress(140)), Step::Applied);
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(t.progress, 100);
        assert!(t.started_at.is_some());
    }

    #[test]
    fn test_complete_clears_error_and_fills_progress() {
        let mut t = task(TaskStatus::InProgress);
        t.last_error = Some("flaky".to_string());
        t.progress = 40;

        assert_eq!(
            apply(
                &mut t,
                TaskAction::Complete {
                    result: Some("done".to_string())
                }
            ),
            Step::Applied
        );
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.progress, 100);
        assert!(t.last_error.is_none());
        assert_eq!(t.result.as_deref(), Some("done"));
    }

    #[test]
    fn test_late_reports_do_not_reopen_completed_task() {
        let mut t = task(TaskStatus::Completed);
        t.progress = 100;
        let before = t.clone();

        assert_eq!(
            apply(&mut t, TaskAction::Start),
            Step::Ignored("task is terminal")
        );
        assert_eq!(
            apply(&mut t, TaskAction::Progress(10)),
            Step::Ignored("task is terminal")
        );
        assert_eq!(
            apply(&mut t, TaskAction::Complete { result: None }),
            Step::Ignored("already completed")
        );
        assert_eq!(t, before);
    }

    #[test]
    fn test_fail_keeps_progress() {
        let mut t = task(TaskStatus::InProgress);
        t.progress = 60;
        assert_eq!(
            apply(
                &mut t,
                TaskAction::Fail {
                    error: "compile error".to_string()
                }
            ),
            Step::Applied
        );
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.progress, 60);
        assert_eq!(t.last_error.as_deref(), Some("compile error"));
    }

    #[test]
    fn test_fail_after_budget_spent_is_permanent() {
        let mut t = task(TaskStatus::InProgress);
        t.retry_count = DEFAULT_MAX_RETRIES;
        apply(
            &mut t,
            TaskAction::Fail {
                error: "still broken".to_string(),
            },
        );
        assert_eq!(t.status, TaskStatus::PermanentlyFailed);
    }

    #[test]
    fn test_retry_requeues_and_counts() {
        let mut t = task(TaskStatus::Failed);
        t.progress = 30;
        t.started_at = Some(Utc::now());

        assert_eq!(apply(&mut t, TaskAction::Retry { max_retries: 3 }), Step::Applied);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.progress, 0);
        assert!(t.started_at.is_none());
    }

    #[test]
    fn test_retry_exhausted_goes_permanent_and_stays() {
        let mut t = task(TaskStatus::Failed);
        t.retry_count = 3;

        assert_eq!(apply(&mut t, TaskAction::Retry { max_retries: 3 }), Step::Applied);
        assert_eq!(t.status, TaskStatus::PermanentlyFailed);
        assert_eq!(t.retry_count, 3);

        assert_eq!(
            apply(&mut t, TaskAction::Retry { max_retries: 3 }),
            Step::Ignored("retry budget exhausted")
        );
        assert_eq!(
            apply(&mut t, TaskAction::Start),
            Step::Ignored("task is terminal")
        );
        assert_eq!(t.status, TaskStatus::PermanentlyFailed);
    }

    #[test]
    fn test_retry_of_healthy_task_is_invalid() {
        let mut t = task(TaskStatus::InProgress);
        let err = apply_action(
            &mut t,
            &TaskAction::Retry { max_retries: 3 },
            RetryPolicy::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn test_requeue_resets_start() {
        let mut t = task(TaskStatus::InProgress);
        t.started_at = Some(Utc::now());
        t.progress = 70;

        assert_eq!(
            apply(
                &mut t,
                TaskAction::Requeue {
                    reason: "stalled after 30 minutes".to_string()
                }
            ),
            Step::Applied
        );
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.started_at.is_none());
        assert_eq!(t.progress, 0);
        assert_eq!(t.retry_count, 0);
    }

    #[test]
    fn test_failed_task_ignores_stale_start() {
        let mut t = task(TaskStatus::Failed);
        assert_eq!(
            apply(&mut t, TaskAction::Start),
            Step::Ignored("task failed and awaits retry")
        );
        assert_eq!(t.status, TaskStatus::Failed);
    }
}
