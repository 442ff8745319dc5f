use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use super::{Snapshot, StateStore};

/// Stores the state document as pretty-printed JSON in a single file.
///
/// Saves write a sibling temp file and rename it over the target, so a
/// concurrent reader never observes a partially written document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_load(&self) -> Result<Snapshot> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Snapshot::default());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Snapshot {
        if !self.path.exists() {
            return Snapshot::default();
        }

        match self.try_load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("State file unreadable, starting from empty state: {:#}", e);
                Snapshot::default()
            }
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).context("Failed to create state directory")?;

        let content = serde_json::to_string_pretty(snapshot).context("Failed to serialize state")?;

        let mut tmp = NamedTempFile::new_in(&parent).context("Failed to create temp state file")?;
        tmp.write_all(content.as_bytes())
            .context("Failed to write temp state file")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to sync temp state file")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }
}
