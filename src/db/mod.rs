mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::dispatch::Mailbox;
use crate::models::*;
use crate::store::{Snapshot, StateStore};

/// SQLite-backed ledger storage.
///
/// Implements [`StateStore`] by replacing both tables inside one transaction
/// per save, and [`Mailbox`] with an append-only `mailbox` table. Cloning is
/// cheap and shares the connection.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        schema::run_migrations(&conn)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))
    }

    // ============================================================
    // Snapshot operations
    // ============================================================

    fn try_load(&self) -> Result<Snapshot> {
        let conn = self.conn()?;
        let mut snapshot = Snapshot::default();

        let mut stmt = conn.prepare(
            "SELECT id, description, status, progress, task_ids, created_at, updated_at
             FROM features",
        )?;
        let features = stmt
            .query_map([], feature_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for feature in features {
            snapshot.features.insert(feature.id.clone(), feature);
        }

        let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks", TASK_COLUMNS))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for task in tasks {
            snapshot.tasks.insert(task.id.clone(), task);
        }

        Ok(snapshot)
    }

    fn try_save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM features", [])?;
        tx.execute("DELETE FROM tasks", [])?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO features (id, description, status, progress, task_ids, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for feature in snapshot.features.values() {
                stmt.execute((
                    &feature.id,
                    &feature.description,
                    feature.status.as_str(),
                    feature.progress as i64,
                    serde_json::to_string(&feature.tasks)?,
                    feature.created_at.to_rfc3339(),
                    feature.updated_at.to_rfc3339(),
                ))?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO tasks (id, feature_id, description, assigned_agent, status, progress,
                                    created_at, updated_at, started_at, retry_count, last_error, result)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for task in snapshot.tasks.values() {
                stmt.execute((
                    &task.id,
                    &task.feature_id,
                    &task.description,
                    &task.assigned_agent,
                    task.status.as_str(),
                    task.progress as i64,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.retry_count as i64,
                    &task.last_error,
                    &task.result,
                ))?;
            }
        }

        tx.commit().context("Failed to commit state snapshot")?;
        Ok(())
    }

    fn try_get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS),
                [id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    fn try_get_feature(&self, id: &str) -> Result<Option<Feature>> {
        let conn = self.conn()?;
        let feature = conn
            .query_row(
                "SELECT id, description, status, progress, task_ids, created_at, updated_at
                 FROM features WHERE id = ?",
                [id],
                feature_from_row,
            )
            .optional()?;
        Ok(feature)
    }
}

impl StateStore for Database {
    fn load(&self) -> Snapshot {
        match self.try_load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Database unreadable, starting from empty state: {:#}", e);
                Snapshot::default()
            }
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.try_save(snapshot)
    }

    fn get_task(&self, id: &str) -> Option<Task> {
        self.try_get_task(id).unwrap_or_else(|e| {
            tracing::warn!("Task lookup failed for {}: {:#}", id, e);
            None
        })
    }

    fn get_feature(&self, id: &str) -> Option<Feature> {
        self.try_get_feature(id).unwrap_or_else(|e| {
            tracing::warn!("Feature lookup failed for {}: {:#}", id, e);
            None
        })
    }
}

// ============================================================
// Mailbox operations
// ============================================================

impl Mailbox for Database {
    fn append(&self, agent_id: &str, message: Message) -> Result<()> {
        let conn = self.conn()?;
        let body = serde_json::to_string(&message).context("Failed to serialize message")?;
        conn.execute(
            "INSERT INTO mailbox (agent_id, message, created_at) VALUES (?, ?, ?)",
            (agent_id, &body, Utc::now().to_rfc3339()),
        )?;
        Ok(())
    }

    fn drain(&self, agent_id: &str) -> Result<Vec<Message>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let rows = {
            let mut stmt =
                tx.prepare("SELECT seq, message FROM mailbox WHERE agent_id = ? ORDER BY seq")?;
            let rows = stmt
                .query_map([agent_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        if let Some((last_seq, _)) = rows.last() {
            tx.execute(
                "DELETE FROM mailbox WHERE agent_id = ? AND seq <= ?",
                (agent_id, last_seq),
            )?;
        }
        tx.commit()?;

        let messages = rows
            .into_iter()
            .filter_map(|(seq, body)| match serde_json::from_str(&body) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!("Dropping unreadable message {} for {}: {}", seq, agent_id, e);
                    None
                }
            })
            .collect();

        Ok(messages)
    }

    fn pending_count(&self, agent_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mailbox WHERE agent_id = ?",
            [agent_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

const TASK_COLUMNS: &str = "id, feature_id, description, assigned_agent, status, progress, \
     created_at, updated_at, started_at, retry_count, last_error, result";

fn feature_from_row(row: &Row<'_>) -> rusqlite::Result<Feature> {
    let status: String = row.get(2)?;
    let task_ids: String = row.get(4)?;
    Ok(Feature {
        id: row.get(0)?,
        description: row.get(1)?,
        status: FeatureStatus::from_str(&status)
            .ok_or_else(|| bad_column(2, format!("unknown feature status {:?}", status)))?,
        progress: clamp_percent(row.get(3)?),
        tasks: serde_json::from_str(&task_ids)
            .map_err(|e| bad_column(4, format!("unreadable task list: {}", e)))?,
        created_at: parse_datetime(5, row.get(5)?)?,
        updated_at: parse_datetime(6, row.get(6)?)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    Ok(Task {
        id: row.get(0)?,
        feature_id: row.get(1)?,
        description: row.get(2)?,
        assigned_agent: row.get(3)?,
        status: TaskStatus::from_str(&status)
            .ok_or_else(|| bad_column(4, format!("unknown task status {:?}", status)))?,
        progress: clamp_percent(row.get(5)?),
        created_at: parse_datetime(6, row.get(6)?)?,
        updated_at: parse_datetime(7, row.get(7)?)?,
        started_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_datetime(8, s))
            .transpose()?,
        retry_count: row.get::<_, i64>(9)?.max(0) as u32,
        last_error: row.get(10)?,
        result: row.get(11)?,
    })
}

fn clamp_percent(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

fn bad_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn parse_datetime(index: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| bad_column(index, format!("bad timestamp {:?}: {}", s, e)))
}
