//! The boundary between the ledger and the agents doing the work.
//!
//! Outbound, a [`TaskAssignment`] is handed to the [`AgentHandler`]
//! registered for the task's agent kind. Inbound, agents post
//! [`StatusReport`]s which are applied through the lifecycle manager. How a
//! signal travels is up to the handler and the [`Mailbox`] behind it.

mod mailbox;
mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::lifecycle::TaskLifecycle;
use crate::models::*;

pub use mailbox::{Mailbox, MemoryMailbox};
pub use registry::{AgentHandler, AgentRegistry, MailboxAgent};

/// Inbox that status reports are posted to.
pub const ORCHESTRATOR: &str = "orchestrator";

/// The "assign task" signal sent to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAssignment {
    pub task_id: String,
    pub feature_id: String,
    pub description: String,
    pub agent: AgentKind,
    /// 1 on the first attempt, incremented by each retry.
    pub attempt: u32,
    /// The task has been attempted before (retried or recovered from a stall).
    pub recovered: bool,
}

impl TaskAssignment {
    pub fn from_task(task: &Task, agent: AgentKind) -> Self {
        Self {
            task_id: task.id.clone(),
            feature_id: task.feature_id.clone(),
            description: task.description.clone(),
            agent,
            attempt: task.retry_count + 1,
            recovered: task.retry_count > 0 || task.last_error.is_some(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message {
            kind: if self.recovered {
                MessageKind::RecoveredTask
            } else {
                MessageKind::NewTask
            },
            sender: ORCHESTRATOR.to_string(),
            recipient: self.agent.as_str().to_string(),
            task_id: self.task_id.clone(),
            feature_id: Some(self.feature_id.clone()),
            content: Some(self.description.clone()),
            progress: None,
            timestamp: Utc::now(),
        }
    }
}

/// A signal from an agent about one of its tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum StatusReport {
    Progress {
        task_id: String,
        progress: i64,
        #[serde(default)]
        message: Option<String>,
    },
    Completed {
        task_id: String,
        #[serde(default)]
        result: Option<String>,
    },
    Failed {
        task_id: String,
        error: String,
    },
}

impl StatusReport {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Progress { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. } => task_id,
        }
    }

    pub fn to_message(&self, sender: &str) -> Message {
        let (kind, content, progress) = match self {
            Self::Progress {
                progress, message, ..
            } => (MessageKind::StatusUpdate, message.clone(), Some(*progress)),
            Self::Completed { result, .. } => (MessageKind::TaskCompleted, result.clone(), None),
            Self::Failed { error, .. } => (MessageKind::TaskFailed, Some(error.clone()), None),
        };
        Message {
            kind,
            sender: sender.to_string(),
            recipient: ORCHESTRATOR.to_string(),
            task_id: self.task_id().to_string(),
            feature_id: None,
            content,
            progress,
            timestamp: Utc::now(),
        }
    }

    /// Read a report back out of a mailbox message. Assignments yield `None`.
    pub fn from_message(message: &Message) -> Option<Self> {
        let task_id = message.task_id.clone();
        match message.kind {
            MessageKind::StatusUpdate => Some(Self::Progress {
                task_id,
                progress: message.progress.unwrap_or(0),
                message: message.content.clone(),
            }),
            MessageKind::TaskCompleted => Some(Self::Completed {
                task_id,
                result: message.content.clone(),
            }),
            MessageKind::TaskFailed => Some(Self::Failed {
                task_id,
                error: message
                    .content
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            }),
            MessageKind::NewTask | MessageKind::RecoveredTask => None,
        }
    }
}

/// Result of a dispatch pass over the pending queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DispatchSummary {
    /// Tasks handed to an agent and now in progress.
    pub assigned: Vec<String>,
    /// Left pending because their agent is at capacity or refused the task.
    pub deferred: Vec<String>,
    /// Assigned to an agent with no registered handler.
    pub unroutable: Vec<String>,
}

/// Result of draining the orchestrator inbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReportSummary {
    pub applied: usize,
    pub ignored: usize,
    pub not_found: usize,
}

/// Moves pending tasks to agents and agent reports back into the ledger.
#[derive(Clone)]
pub struct Dispatcher {
    lifecycle: TaskLifecycle,
    registry: AgentRegistry,
    mailbox: Arc<dyn Mailbox>,
    max_concurrent: usize,
}

impl Dispatcher {
    pub fn new(
        lifecycle: TaskLifecycle,
        registry: AgentRegistry,
        mailbox: Arc<dyn Mailbox>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            mailbox,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// How many more tasks `kind` may take before hitting its concurrency limit.
    pub fn capacity(&self, kind: AgentKind) -> usize {
        let busy = in_progress_by_agent(&self.lifecycle.snapshot().tasks)
            .get(kind.as_str())
            .copied()
            .unwrap_or(0);
        self.max_concurrent.saturating_sub(busy)
    }

    /// Assign one pending task to its agent, respecting the agent's capacity.
    pub fn assign(&self, task_id: &str) -> Result<TransitionOutcome> {
        let Some(task) = self.lifecycle.get_task(task_id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if task.status != TaskStatus::Pending {
            return Ok(TransitionOutcome::Ignored {
                task,
                reason: "task is not pending".to_string(),
            });
        }

        let kind = AgentKind::from_str(&task.assigned_agent)
            .ok_or_else(|| LedgerError::InvalidAgent(task.assigned_agent.clone()))?;
        if self.capacity(kind) == 0 {
            return Ok(TransitionOutcome::Ignored {
                task,
                reason: format!("{} agent is at capacity", kind),
            });
        }

        self.hand_off(task_id, kind)
    }

    /// Hand every pending task whose agent has free capacity to that agent,
    /// oldest first.
    pub fn dispatch_pending(&self) -> Result<DispatchSummary> {
        let snapshot = self.lifecycle.snapshot();
        let mut busy = in_progress_by_agent(&snapshot.tasks);

        let mut pending: Vec<&Task> = snapshot
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut summary = DispatchSummary::default();
        for task in pending {
            let Some(kind) = AgentKind::from_str(&task.assigned_agent)
                .filter(|kind| self.registry.get(*kind).is_some())
            else {
                tracing::warn!(task_id = %task.id, "No handler for agent {}", task.assigned_agent);
                summary.unroutable.push(task.id.clone());
                continue;
            };

            let load = busy.entry(kind.as_str().to_string()).or_insert(0);
            if *load >= self.max_concurrent {
                summary.deferred.push(task.id.clone());
                continue;
            }

            match self.hand_off(&task.id, kind)? {
                TransitionOutcome::Applied(_) => {
                    *load += 1;
                    summary.assigned.push(task.id.clone());
                }
                _ => summary.deferred.push(task.id.clone()),
            }
        }

        if !summary.assigned.is_empty() {
            tracing::info!(
                "Dispatched {} tasks ({} deferred)",
                summary.assigned.len(),
                summary.deferred.len()
            );
        }
        Ok(summary)
    }

    /// Route one agent report through the matching lifecycle transition.
    pub fn handle_report(&self, report: &StatusReport) -> Result<TransitionOutcome> {
        match report {
            StatusReport::Progress {
                task_id, progress, ..
            } => self.lifecycle.update_progress(task_id, *progress),
            StatusReport::Completed { task_id, result } => {
                self.lifecycle.complete(task_id, result.clone())
            }
            StatusReport::Failed { task_id, error } => self.lifecycle.fail(task_id, error.clone()),
        }
    }

    /// Drain the orchestrator inbox and apply every report in it.
    ///
    /// If applying a report fails, it and every report after it are put back
    /// in the inbox before the error is returned.
    pub fn process_reports(&self) -> Result<ReportSummary> {
        let messages = self.mailbox.drain(ORCHESTRATOR)?;
        let mut summary = ReportSummary::default();

        for (index, message) in messages.iter().enumerate() {
            let Some(report) = StatusReport::from_message(message) else {
                tracing::warn!(
                    task_id = %message.task_id,
                    "Dropping {} message sent to the orchestrator",
                    message.kind.as_str()
                );
                continue;
            };

            match self.handle_report(&report) {
                Ok(TransitionOutcome::Applied(_)) => summary.applied += 1,
                Ok(TransitionOutcome::Ignored { .. }) => summary.ignored += 1,
                Ok(TransitionOutcome::NotFound) => summary.not_found += 1,
                Err(e) => {
                    for unprocessed in &messages[index..] {
                        self.mailbox.append(ORCHESTRATOR, unprocessed.clone())?;
                    }
                    return Err(e);
                }
            }
        }

        Ok(summary)
    }

    /// Start the task and hand it to its agent. A refused hand-off puts the
    /// task back to pending and is reported as `Ignored`.
    fn hand_off(&self, task_id: &str, kind: AgentKind) -> Result<TransitionOutcome> {
        let handler = self
            .registry
            .get(kind)
            .ok_or_else(|| LedgerError::InvalidAgent(kind.as_str().to_string()))?;

        let outcome = self.lifecycle.start(task_id)?;
        let assignment = match &outcome {
            TransitionOutcome::Applied(task) => TaskAssignment::from_task(task, kind),
            _ => return Ok(outcome),
        };

        if let Err(e) = handler.accept_task(&assignment) {
            tracing::warn!(task_id = %task_id, "Agent {} refused task: {:#}", kind, e);
            let reason = format!("dispatch to {} failed: {:#}", kind, e);
            let requeued = self.lifecycle.requeue(task_id, reason.clone())?;
            return Ok(match requeued {
                TransitionOutcome::Applied(task) | TransitionOutcome::Ignored { task, .. } => {
                    TransitionOutcome::Ignored { task, reason }
                }
                TransitionOutcome::NotFound => TransitionOutcome::NotFound,
            });
        }

        tracing::info!(
            task_id = %task_id,
            attempt = assignment.attempt,
            "Assigned to {}",
            kind
        );
        Ok(outcome)
    }
}

fn in_progress_by_agent(tasks: &BTreeMap<String, Task>) -> BTreeMap<String, usize> {
    let mut busy = BTreeMap::new();
    for task in tasks.values().filter(|t| t.status == TaskStatus::InProgress) {
        *busy.entry(task.assigned_agent.clone()).or_insert(0) += 1;
    }
    busy
}
