use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;

use crate::models::Message;

/// Per-agent message queue.
///
/// Delivery is at-least-once and ordering across appends from different
/// writers is not guaranteed; consumers apply messages idempotently.
pub trait Mailbox: Send + Sync {
    fn append(&self, agent_id: &str, message: Message) -> Result<()>;

    /// Remove and return every message queued for `agent_id`, oldest first.
    fn drain(&self, agent_id: &str) -> Result<Vec<Message>>;

    fn pending_count(&self, agent_id: &str) -> Result<usize>;
}

/// In-process mailbox for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<Message>>>> {
        self.queues
            .lock()
            .map_err(|_| anyhow::anyhow!("mailbox lock poisoned"))
    }
}

impl Mailbox for MemoryMailbox {
    fn append(&self, agent_id: &str, message: Message) -> Result<()> {
        self.queues()?
            .entry(agent_id.to_string())
            .or_default()
            .push_back(message);
        Ok(())
    }

    fn drain(&self, agent_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .queues()?
            .remove(agent_id)
            .map(Vec::from)
            .unwrap_or_default())
    }

    fn pending_count(&self, agent_id: &str) -> Result<usize> {
        Ok(self.queues()?.get(agent_id).map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;
    use chrono::Utc;

    fn message(task_id: &str) -> Message {
        Message {
            kind: MessageKind::NewTask,
            sender: "orchestrator".to_string(),
            recipient: "backend".to_string(),
            task_id: task_id.to_string(),
            feature_id: None,
            content: None,
            progress: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_drain_returns_in_append_order_and_empties() {
        let mailbox = MemoryMailbox::new();
        mailbox.append("backend", message("T1")).unwrap();
        mailbox.append("backend", message("T2")).unwrap();
        mailbox.append("frontend", message("T3")).unwrap();

        assert_eq!(mailbox.pending_count("backend").unwrap(), 2);

        let drained = mailbox.drain("backend").unwrap();
        let ids: Vec<_> = drained.iter().map(|m| m.task_id.as_str()).collect();
        assert_eq!(ids, vec!["T1", "T2"]);

        assert!(mailbox.drain("backend").unwrap().is_empty());
        assert_eq!(mailbox.pending_count("frontend").unwrap(), 1);
    }
}
