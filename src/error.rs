//! Error types surfaced by the ledger.
//!
//! Recoverable conditions (agent failures, stalls, unknown ids in agent
//! reports) are encoded in return values. What remains here are the cases a
//! caller has to act on: bad input, programmer-error transitions and store
//! write failures.

use thiserror::Error;

use crate::models::TaskStatus;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    #[error("Feature already exists: {0}")]
    DuplicateFeature(String),

    #[error("Cannot {action} task {task_id} while it is {from}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        action: &'static str,
    },

    #[error("Unknown agent: {0}")]
    InvalidAgent(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
