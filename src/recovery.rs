//! Health auditing and corrective batch operations.
//!
//! Every sweep is a single read-modify-write cycle through the lifecycle
//! manager, and every sweep is idempotent: with nothing stalled, failed or
//! old, a second run changes nothing and reports empty results.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};

use crate::error::{LedgerError, Result};
use crate::lifecycle::{TaskAction, TaskLifecycle};
use crate::models::*;
use crate::progress::recompute_feature;
use crate::store::Snapshot;

/// Thresholds used when classifying and repairing tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// In progress for longer than this is presumed abandoned.
    pub stall_timeout_minutes: i64,
    /// In progress for longer than this is reported, but left alone.
    pub long_running_minutes: i64,
    pub max_retries: u32,
    /// Terminal tasks untouched for longer than this are removed by cleanup.
    pub retention_days: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            stall_timeout_minutes: 30,
            long_running_minutes: 15,
            max_retries: crate::lifecycle::DEFAULT_MAX_RETRIES,
            retention_days: 7,
        }
    }
}

#[derive(Clone)]
pub struct RecoveryEngine {
    lifecycle: TaskLifecycle,
    policy: RecoveryPolicy,
}

impl RecoveryEngine {
    pub fn new(lifecycle: TaskLifecycle, policy: RecoveryPolicy) -> Self {
        Self { lifecycle, policy }
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    // ============================================================
    // Audit
    // ============================================================

    pub fn health_check(&self) -> HealthReport {
        classify(&self.lifecycle.snapshot(), &self.policy, Utc::now())
    }

    pub fn statistics(&self) -> TaskStatistics {
        let snapshot = self.lifecycle.snapshot();
        let mut stats = TaskStatistics {
            total_tasks: snapshot.tasks.len(),
            ..Default::default()
        };
        if snapshot.tasks.is_empty() {
            return stats;
        }

        let mut retries = 0u64;
        for task in snapshot.tasks.values() {
            *stats.by_status.entry(task.status).or_insert(0) += 1;
            *stats
                .by_agent
                .entry(task.assigned_agent.clone())
                .or_insert(0) += 1;
            retries += u64::from(task.retry_count);
            if task.last_error.is_some() {
                stats.tasks_with_errors += 1;
            }
        }

        let total = stats.total_tasks as f64;
        let completed = stats
            .by_status
            .get(&TaskStatus::Completed)
            .copied()
            .unwrap_or(0);
        stats.completion_rate = completed as f64 / total;
        stats.average_retry_count = retries as f64 / total;
        stats
    }

    /// Pending tasks assigned to `agent`, oldest first.
    pub fn pending_tasks_by_agent(&self, agent: &str) -> Vec<PendingTask> {
        let snapshot = self.lifecycle.snapshot();
        let agent = AgentKind::from_str(agent)
            .map(|kind| kind.as_str().to_string())
            .unwrap_or_else(|| agent.to_string());
        pending_for(&snapshot, &agent)
    }

    /// Workload for every worker kind, plus any other agent that owns tasks.
    pub fn agent_workloads(&self) -> Vec<AgentWorkload> {
        let snapshot = self.lifecycle.snapshot();

        let mut agents: Vec<String> = AgentKind::WORKERS
            .iter()
            .map(|kind| kind.as_str().to_string())
            .collect();
        let extra: BTreeSet<&String> = snapshot
            .tasks
            .values()
            .map(|t| &t.assigned_agent)
            .filter(|a| !agents.contains(a))
            .collect();
        agents.extend(extra.into_iter().cloned());

        agents
            .into_iter()
            .map(|agent| {
                let owned = snapshot.tasks.values().filter(|t| t.assigned_agent == agent);
                let total_tasks = owned.clone().count();
                let in_progress = owned
                    .filter(|t| t.status == TaskStatus::InProgress)
                    .count();
                let pending = pending_for(&snapshot, &agent);
                AgentWorkload {
                    agent,
                    total_tasks,
                    in_progress,
                    pending,
                }
            })
            .collect()
    }

    // ============================================================
    // Repair
    // ============================================================

    /// Put every task in progress for longer than `timeout_minutes` back in
    /// the queue. Returns the requeued task ids.
    ///
    /// A timeout too large to represent matches nothing.
    pub fn recover_stalled_tasks(&self, timeout_minutes: i64) -> Result<Vec<String>> {
        if timeout_minutes < 0 {
            return Err(LedgerError::InvalidInput(format!(
                "stall timeout must not be negative, got {} minutes",
                timeout_minutes
            )));
        }
        let Some(timeout) = Duration::try_minutes(timeout_minutes) else {
            return Ok(Vec::new());
        };

        self.lifecycle.update(|snapshot, now| {
            let stalled: Vec<(String, i64)> = snapshot
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::InProgress)
                .filter_map(|t| {
                    let elapsed = now - t.running_since();
                    (elapsed > timeout).then(|| (t.id.clone(), elapsed.num_minutes()))
                })
                .collect();

            let mut recovered = Vec::new();
            for (task_id, minutes) in stalled {
                let action = TaskAction::Requeue {
                    reason: format!("stalled after {} minutes", minutes),
                };
                if self
                    .lifecycle
                    .transition_in(snapshot, &task_id, &action, now)?
                    .is_applied()
                {
                    tracing::warn!(task_id = %task_id, "Recovered stalled task after {} minutes", minutes);
                    recovered.push(task_id);
                }
            }

            let dirty = !recovered.is_empty();
            Ok((recovered, dirty))
        })
    }

    /// Re-queue failed tasks with retries left; exhaust the rest.
    pub fn retry_failed_tasks(&self, max_retries: u32) -> Result<RetrySummary> {
        self.lifecycle.update(|snapshot, now| {
            let failed: Vec<String> = snapshot
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.id.clone())
                .collect();

            let mut summary = RetrySummary::default();
            let action = TaskAction::Retry { max_retries };
            for task_id in failed {
                let outcome = self
                    .lifecycle
                    .transition_in(snapshot, &task_id, &action, now)?;
                match outcome {
                    TransitionOutcome::Applied(task) if task.status == TaskStatus::Pending => {
                        summary.retried.push(task.id);
                    }
                    TransitionOutcome::Applied(task) => {
                        tracing::warn!(task_id = %task.id, "Retry budget exhausted after {} attempts", task.retry_count);
                        summary.exhausted.push(task.id);
                    }
                    _ => {}
                }
            }

            let dirty = !summary.retried.is_empty() || !summary.exhausted.is_empty();
            Ok((summary, dirty))
        })
    }

    /// Remove terminal tasks not updated in the last `keep_days` days and
    /// prune them from their features. Returns how many were removed.
    ///
    /// A window reaching past the earliest representable date removes nothing.
    pub fn cleanup_completed_tasks(&self, keep_days: u32) -> Result<usize> {
        self.lifecycle.update(|snapshot, now| {
            let Some(cutoff) = Duration::try_days(i64::from(keep_days))
                .and_then(|window| now.checked_sub_signed(window))
            else {
                return Ok((0, false));
            };
            let expired: BTreeSet<String> = snapshot
                .tasks
                .values()
                .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
                .map(|t| t.id.clone())
                .collect();
            if expired.is_empty() {
                return Ok((0, false));
            }

            let mut touched = BTreeSet::new();
            for task_id in &expired {
                if let Some(task) = snapshot.tasks.remove(task_id) {
                    touched.insert(task.feature_id);
                }
            }
            for feature in snapshot.features.values_mut() {
                let before = feature.tasks.len();
                feature.tasks.retain(|id| !expired.contains(id));
                if feature.tasks.len() != before {
                    touched.insert(feature.id.clone());
                }
            }
            for feature_id in &touched {
                recompute_feature(snapshot, feature_id, now);
            }

            tracing::info!("Cleaned up {} tasks older than {} days", expired.len(), keep_days);
            Ok((expired.len(), true))
        })
    }

    /// Health check, then stall recovery, failed-task retry and cleanup, in
    /// that order. Does nothing when the health check is clean.
    pub fn full_recovery(&self) -> Result<RecoverySummary> {
        let report = self.health_check();
        if report.healthy {
            tracing::debug!("System healthy, skipping recovery");
            return Ok(RecoverySummary {
                skipped: true,
                ..Default::default()
            });
        }

        let stalled_recovered = self.recover_stalled_tasks(self.policy.stall_timeout_minutes)?;
        let retry = self.retry_failed_tasks(self.policy.max_retries)?;
        let cleaned = self.cleanup_completed_tasks(self.policy.retention_days)?;

        let summary = RecoverySummary {
            skipped: false,
            stalled_recovered,
            failed_retried: retry.retried,
            permanently_failed: retry.exhausted,
            cleaned,
        };
        tracing::info!(
            stalled = summary.stalled_recovered.len(),
            retried = summary.failed_retried.len(),
            exhausted = summary.permanently_failed.len(),
            cleaned = summary.cleaned,
            "Recovery pass complete"
        );
        Ok(summary)
    }
}

/// Sort the task population into health buckets as of `now`.
pub fn classify(snapshot: &Snapshot, policy: &RecoveryPolicy, now: DateTime<Utc>) -> HealthReport {
    let stall = Duration::try_minutes(policy.stall_timeout_minutes).unwrap_or(Duration::MAX);
    let long = Duration::try_minutes(policy.long_running_minutes).unwrap_or(Duration::MAX);

    let mut status_counts = BTreeMap::new();
    let mut stalled_tasks = Vec::new();
    let mut failed_tasks = Vec::new();
    let mut exhausted_tasks = Vec::new();
    let mut long_running_tasks = Vec::new();

    for task in snapshot.tasks.values() {
        *status_counts.entry(task.status).or_insert(0) += 1;
        match task.status {
            TaskStatus::InProgress => {
                let elapsed = now - task.running_since();
                if elapsed > stall {
                    stalled_tasks.push(TaskIssue::from(task));
                } else if elapsed > long {
                    long_running_tasks.push(TaskIssue::from(task));
                }
            }
            TaskStatus::Failed if task.retry_count < policy.max_retries => {
                failed_tasks.push(TaskIssue::from(task));
            }
            TaskStatus::Failed => exhausted_tasks.push(TaskIssue::from(task)),
            _ => {}
        }
    }

    HealthReport {
        healthy: stalled_tasks.is_empty()
            && failed_tasks.is_empty()
            && exhausted_tasks.is_empty()
            && long_running_tasks.is_empty(),
        total_tasks: snapshot.tasks.len(),
        status_counts,
        stalled_tasks,
        failed_tasks,
        exhausted_tasks,
        long_running_tasks,
        checked_at: now,
    }
}

fn pending_for(snapshot: &Snapshot, agent: &str) -> Vec<PendingTask> {
    let mut pending: Vec<PendingTask> = snapshot
        .tasks
        .values()
        .filter(|t| t.assigned_agent == agent && t.status == TaskStatus::Pending)
        .map(|t| PendingTask {
            task_id: t.id.clone(),
            feature_id: t.feature_id.clone(),
            description: t.description.clone(),
            created_at: t.created_at,
            retry_count: t.retry_count,
        })
        .collect();
    pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    pending
}
