//! Plain-text rendering of ledger views for the terminal.

use chrono::{DateTime, Duration, Utc};

use crate::dispatch::DispatchSummary;
use crate::models::*;

const BAR_WIDTH: usize = 20;

fn task_symbol(status: TaskStatus) -> char {
    match status {
        TaskStatus::Pending => '○',
        TaskStatus::InProgress => '◐',
        TaskStatus::Completed => '●',
        TaskStatus::Failed => '✗',
        TaskStatus::PermanentlyFailed => '⊘',
    }
}

/// `[██████░░░░░░░░░░░░░░]  30%`
pub fn progress_bar(progress: u8) -> String {
    let progress = progress.min(100) as usize;
    let filled = progress * BAR_WIDTH / 100;
    format!(
        "[{}{}] {:>3}%",
        "█".repeat(filled),
        "░".repeat(BAR_WIDTH - filled),
        progress
    )
}

/// Compact human duration: `45s`, `12m 5s`, `3h 20m`, `2d 4h`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0);
    let (days, hours, minutes, seconds) = (
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60,
    );
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Remaining time, extrapolated linearly from progress since creation.
pub fn estimate_remaining(feature: &Feature, now: DateTime<Utc>) -> Option<Duration> {
    if feature.progress == 0 || feature.progress >= 100 {
        return None;
    }
    let elapsed = (now - feature.created_at).num_seconds().max(0);
    let total = elapsed * 100 / i64::from(feature.progress);
    Some(Duration::seconds(total - elapsed))
}

/// Render features and their tasks as a tree.
///
/// ```text
/// F1 Login page [███████████████░░░░░]  75% in_progress (ETA 10m 0s)
/// ├── ● T1 frontend 100% Build the form
/// └── ◐ T2 backend   50% Session endpoint
/// ```
pub fn render_features(features: &[FeatureProgress], now: DateTime<Utc>) -> String {
    if features.is_empty() {
        return "No features.\n".to_string();
    }

    let mut output = String::new();
    for fp in features {
        let feature = &fp.feature;
        output.push_str(&format!(
            "{} {} {} {}",
            feature.id,
            feature.description,
            progress_bar(feature.progress),
            feature.status.as_str()
        ));
        if let Some(eta) = estimate_remaining(feature, now) {
            output.push_str(&format!(" (ETA {})", format_duration(eta)));
        }
        output.push('\n');

        for (i, task) in fp.tasks.iter().enumerate() {
            let branch = if i == fp.tasks.len() - 1 { "└── " } else { "├── " };
            output.push_str(&format!(
                "{}{} {} {} {:>3}% {}\n",
                branch,
                task_symbol(task.status),
                task.id,
                task.assigned_agent,
                task.progress,
                task.description
            ));
        }
    }
    output
}

pub fn render_task(task: &Task) -> String {
    let mut output = format!(
        "{} {} [{}]\n  feature:  {}\n  agent:    {}\n  progress: {}\n  retries:  {}\n",
        task_symbol(task.status),
        task.id,
        task.status,
        task.feature_id,
        task.assigned_agent,
        progress_bar(task.progress),
        task.retry_count
    );
    if let Some(started) = task.started_at {
        output.push_str(&format!("  started:  {}\n", started.to_rfc3339()));
    }
    if let Some(error) = &task.last_error {
        output.push_str(&format!("  error:    {}\n", error));
    }
    if let Some(result) = &task.result {
        output.push_str(&format!("  result:   {}\n", result));
    }
    output.push_str(&format!("  {}\n", task.description));
    output
}

fn render_issues(output: &mut String, title: &str, issues: &[TaskIssue], now: DateTime<Utc>) {
    if issues.is_empty() {
        return;
    }
    output.push_str(&format!("{} ({}):\n", title, issues.len()));
    for issue in issues {
        output.push_str(&format!("  - {} [{}] {}", issue.task_id, issue.agent, issue.description));
        if let Some(started) = issue.started_at {
            output.push_str(&format!(" (running {})", format_duration(now - started)));
        }
        if let Some(error) = &issue.error {
            output.push_str(&format!(" retries={} error: {}", issue.retry_count, error));
        }
        output.push('\n');
    }
}

pub fn render_health(report: &HealthReport) -> String {
    let mut output = format!(
        "Health: {} ({} tasks)\n",
        if report.healthy { "OK" } else { "ISSUES FOUND" },
        report.total_tasks
    );
    for (status, count) in &report.status_counts {
        output.push_str(&format!("  {:<20}{}\n", status.as_str(), count));
    }
    render_issues(&mut output, "Stalled", &report.stalled_tasks, report.checked_at);
    render_issues(&mut output, "Failed", &report.failed_tasks, report.checked_at);
    render_issues(
        &mut output,
        "Retries exhausted",
        &report.exhausted_tasks,
        report.checked_at,
    );
    render_issues(
        &mut output,
        "Long running",
        &report.long_running_tasks,
        report.checked_at,
    );
    output
}

pub fn render_recovery(summary: &RecoverySummary) -> String {
    if summary.skipped {
        return "System healthy, no recovery needed.\n".to_string();
    }
    format!(
        "Recovery complete: {} actions\n  stalled recovered:  {}\n  failed retried:     {}\n  permanently failed: {}\n  cleaned up:         {}\n",
        summary.total_actions(),
        summary.stalled_recovered.len(),
        summary.failed_retried.len(),
        summary.permanently_failed.len(),
        summary.cleaned
    )
}

pub fn render_workloads(workloads: &[AgentWorkload]) -> String {
    let mut output = String::new();
    for workload in workloads {
        output.push_str(&format!(
            "{:<14} {} pending, {} in progress, {} total\n",
            workload.agent,
            workload.pending.len(),
            workload.in_progress,
            workload.total_tasks
        ));
        for task in workload.pending.iter().take(3) {
            let description: String = task.description.chars().take(60).collect();
            output.push_str(&format!("    - {} {}\n", task.task_id, description));
        }
        if workload.pending.len() > 3 {
            output.push_str(&format!("    ... and {} more\n", workload.pending.len() - 3));
        }
    }
    output
}

pub fn render_statistics(stats: &TaskStatistics) -> String {
    let mut output = format!(
        "Tasks: {}\nCompletion rate: {:.1}%\nAverage retries: {:.2}\nTasks with errors: {}\n",
        stats.total_tasks,
        stats.completion_rate * 100.0,
        stats.average_retry_count,
        stats.tasks_with_errors
    );
    if !stats.by_status.is_empty() {
        output.push_str("By status:\n");
        for (status, count) in &stats.by_status {
            output.push_str(&format!("  {:<20}{}\n", status.as_str(), count));
        }
    }
    if !stats.by_agent.is_empty() {
        output.push_str("By agent:\n");
        for (agent, count) in &stats.by_agent {
            output.push_str(&format!("  {:<20}{}\n", agent, count));
        }
    }
    output
}

pub fn render_dispatch(summary: &DispatchSummary) -> String {
    let mut output = format!("Assigned {} tasks", summary.assigned.len());
    if !summary.deferred.is_empty() {
        output.push_str(&format!(", {} waiting for capacity", summary.deferred.len()));
    }
    if !summary.unroutable.is_empty() {
        output.push_str(&format!(", {} with no agent", summary.unroutable.len()));
    }
    output.push('\n');
    for id in &summary.assigned {
        output.push_str(&format!("  → {}\n", id));
    }
    output
}
