use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use super::mailbox::Mailbox;
use super::{StatusReport, TaskAssignment, ORCHESTRATOR};
use crate::models::AgentKind;

/// The capability every agent kind is mapped to.
pub trait AgentHandler: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Hand a task to the agent. Returning `Err` puts the task back in the queue.
    fn accept_task(&self, assignment: &TaskAssignment) -> Result<()>;

    /// Relay a status report from the agent back to the ledger.
    fn report_progress(&self, report: &StatusReport) -> Result<()>;
}

/// Agent handler that speaks through a [`Mailbox`].
///
/// Assignments go to the agent's own inbox; reports go to the orchestrator's.
pub struct MailboxAgent {
    kind: AgentKind,
    mailbox: Arc<dyn Mailbox>,
}

impl MailboxAgent {
    pub fn new(kind: AgentKind, mailbox: Arc<dyn Mailbox>) -> Self {
        Self { kind, mailbox }
    }
}

impl AgentHandler for MailboxAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn accept_task(&self, assignment: &TaskAssignment) -> Result<()> {
        self.mailbox
            .append(self.kind.as_str(), assignment.to_message())
    }

    fn report_progress(&self, report: &StatusReport) -> Result<()> {
        self.mailbox
            .append(ORCHESTRATOR, report.to_message(self.kind.as_str()))
    }
}

/// Static mapping from agent kind to handler, fixed at startup.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    handlers: BTreeMap<AgentKind, Arc<dyn AgentHandler>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry routing every worker kind through `mailbox`.
    pub fn with_mailbox(mailbox: Arc<dyn Mailbox>) -> Self {
        let mut registry = Self::new();
        for kind in AgentKind::WORKERS {
            registry.register(Arc::new(MailboxAgent::new(kind, mailbox.clone())));
        }
        registry
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, handler: Arc<dyn AgentHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn AgentHandler>> {
        self.handlers.get(&kind).cloned()
    }
}
