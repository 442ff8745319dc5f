//! Durable state for features and tasks.
//!
//! All state lives in one logical document with two keyed collections,
//! `features` and `tasks`. Every operation reads the whole snapshot, mutates
//! it, and writes the whole snapshot back. A store guarantees only that a
//! single `save` is atomic: readers see either the previous or the new
//! document, never a torn one.

mod json;

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::models::{Feature, Task};

pub use json::JsonFileStore;

/// The full persisted state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    #[serde(default)]
    pub features: BTreeMap<String, Feature>,
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
}

impl Snapshot {
    /// The tasks a feature owns, in the feature's list order.
    ///
    /// Identifiers that no longer resolve are skipped.
    pub fn feature_tasks(&self, feature_id: &str) -> Vec<&Task> {
        self.features
            .get(feature_id)
            .map(|feature| {
                feature
                    .tasks
                    .iter()
                    .filter_map(|id| self.tasks.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Persistence backend for the ledger.
///
/// `load` never fails: a missing or unreadable backing store yields an empty
/// snapshot. `save` is the one operation whose failure must reach the caller.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Snapshot;

    fn save(&self, snapshot: &Snapshot) -> Result<()>;

    fn get_task(&self, id: &str) -> Option<Task> {
        self.load().tasks.remove(id)
    }

    fn get_feature(&self, id: &str) -> Option<Feature> {
        self.load().features.remove(id)
    }
}
