//! Feature progress aggregation.
//!
//! A feature's `progress` and `status` are a pure function of its tasks:
//!
//! - progress = floor(sum of task progress / task count), 0 with no tasks
//! - status = `completed` if every task is completed, otherwise
//!   `in_progress` if any task is completed or the progress sum is non-zero,
//!   otherwise `pending`
//!
//! A feature with no tasks keeps its current status; it is never completed
//! by vacuous truth.

use chrono::{DateTime, Utc};

use crate::models::{Feature, FeatureStatus, Task, TaskStatus};
use crate::store::Snapshot;

/// Compute `(progress, status)` for a set of tasks, or `None` when empty.
pub fn aggregate(tasks: &[&Task]) -> Option<(u8, FeatureStatus)> {
    if tasks.is_empty() {
        return None;
    }

    let total: u32 = tasks.iter().map(|t| u32::from(t.progress.min(100))).sum();
    let completed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();

    let progress = (total / tasks.len() as u32) as u8;
    let status = if completed == tasks.len() {
        FeatureStatus::Completed
    } else if completed > 0 || total > 0 {
        FeatureStatus::InProgress
    } else {
        FeatureStatus::Pending
    };

    Some((progress, status))
}

/// Recompute a feature in place from the tasks it owns.
///
/// Returns the updated feature, or `None` if the feature does not exist.
pub fn recompute_feature<'a>(
    snapshot: &'a mut Snapshot,
    feature_id: &str,
    now: DateTime<Utc>,
) -> Option<&'a Feature> {
    let computed = {
        let tasks = snapshot.feature_tasks(feature_id);
        aggregate(&tasks)
    };

    let feature = snapshot.features.get_mut(feature_id)?;
    match computed {
        Some((progress, status)) => {
            feature.progress = progress;
            feature.status = status;
        }
        None => feature.progress = 0,
    }
    feature.updated_at = now;

    Some(feature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus, progress: u8) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            feature_id: "F1".to_string(),
            description: format!("task {}", id),
            assigned_agent: "frontend".to_string(),
            status,
            progress,
            created_at: now,
            updated_at: now,
            started_at: None,
            retry_count: 0,
            last_error: None,
            result: None,
        }
    }

    fn snapshot_with(tasks: Vec<Task>) -> Snapshot {
        let now = Utc::now();
        let mut snapshot = Snapshot::default();
        snapshot.features.insert(
            "F1".to_string(),
            Feature {
                id: "F1".to_string(),
                description: "feature".to_string(),
                status: FeatureStatus::Pending,
                progress: 0,
                tasks: tasks.iter().map(|t| t.id.clone()).collect(),
                created_at: now,
                updated_at: now,
            },
        );
        for t in tasks {
            snapshot.tasks.insert(t.id.clone(), t);
        }
        snapshot
    }

    #[test]
    fn test_no_tasks_is_not_completed() {
        assert_eq!(aggregate(&[]), None);

        let mut snapshot = snapshot_with(vec![]);
        let feature = recompute_feature(&mut snapshot, "F1", Utc::now()).unwrap();
        assert_eq!(feature.progress, 0);
        assert_eq!(feature.status, FeatureStatus::Pending);
    }

    #[test]
    fn test_mean_progress_is_floored() {
        let a = task("T1", TaskStatus::InProgress, 33);
        let b = task("T2", TaskStatus::InProgress, 34);
        let c = task("T3", TaskStatus::Pending, 0);
        assert_eq!(
            aggregate(&[&a, &b, &c]),
            Some((22, FeatureStatus::InProgress))
        );
    }

    #[test]
    fn test_completed_and_half_done() {
        let a = task("T1", TaskStatus::Completed, 100);
        let b = task("T2", TaskStatus::InProgress, 50);
        assert_eq!(aggregate(&[&a, &b]), Some((75, FeatureStatus::InProgress)));
    }

    #[test]
    fn test_all_completed() {
        let a = task("T1", TaskStatus::Completed, 100);
        let b = task("T2", TaskStatus::Completed, 100);
        assert_eq!(aggregate(&[&a, &b]), Some((100, FeatureStatus::Completed)));
    }

    #[test]
    fn test_untouched_tasks_are_pending() {
        let a = task("T1", TaskStatus::Pending, 0);
        let b = task("T2", TaskStatus::InProgress, 0);
        assert_eq!(aggregate(&[&a, &b]), Some((0, FeatureStatus::Pending)));
    }

    #[test]
    fn test_completed_with_zero_progress_counts_as_started() {
        let a = task("T1", TaskStatus::Completed, 0);
        let b = task("T2", TaskStatus::Pending, 0);
        assert_eq!(aggregate(&[&a, &b]), Some((0, FeatureStatus::InProgress)));
    }

    #[test]
    fn test_dangling_task_ids_are_skipped() {
        let mut snapshot = snapshot_with(vec![task("T1", TaskStatus::Completed, 100)]);
        snapshot
            .features
            .get_mut("F1")
            .unwrap()
            .tasks
            .push("gone".to_string());

        let feature = recompute_feature(&mut snapshot, "F1", Utc::now()).unwrap();
        assert_eq!(feature.progress, 100);
        assert_eq!(feature.status, FeatureStatus::Completed);
    }

    #[test]
    fn test_unknown_feature_returns_none() {
        let mut snapshot = Snapshot::default();
        assert!(recompute_feature(&mut snapshot, "nope", Utc::now()).is_none());
    }
}
