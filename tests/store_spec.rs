use chrono::Utc;
use crewledger::db::Database;
use crewledger::dispatch::{Mailbox, ORCHESTRATOR};
use crewledger::models::*;
use crewledger::store::{JsonFileStore, Snapshot, StateStore};
use speculate2::speculate;

fn sample_snapshot() -> Snapshot {
    let now = Utc::now();
    let mut snapshot = Snapshot::default();
    snapshot.features.insert(
        "F1".to_string(),
        Feature {
            id: "F1".to_string(),
            description: "Payments".to_string(),
            status: FeatureStatus::InProgress,
            progress: 50,
            tasks: vec!["T1".to_string(), "T2".to_string()],
            created_at: now,
            updated_at: now,
        },
    );
    for (id, status, progress) in [
        ("T1", TaskStatus::Completed, 100),
        ("T2", TaskStatus::Pending, 0),
    ] {
        snapshot.tasks.insert(
            id.to_string(),
            Task {
                id: id.to_string(),
                feature_id: "F1".to_string(),
                description: format!("Task {}", id),
                assigned_agent: "backend".to_string(),
                status,
                progress,
                created_at: now,
                updated_at: now,
                started_at: (status == TaskStatus::Completed).then_some(now),
                retry_count: 0,
                last_error: None,
                result: (status == TaskStatus::Completed).then(|| "ok".to_string()),
            },
        );
    }
    snapshot
}

fn message(task_id: &str, kind: MessageKind) -> Message {
    Message {
        kind,
        sender: "backend".to_string(),
        recipient: ORCHESTRATOR.to_string(),
        task_id: task_id.to_string(),
        feature_id: None,
        content: None,
        progress: None,
        timestamp: Utc::now(),
    }
}

speculate! {
    before {
        let db = Database::open_memory().expect("Failed to create in-memory database");
        db.migrate().expect("Failed to run migrations");
    }

    describe "database state store" {
        it "loads an empty snapshot from a fresh database" {
            assert_eq!(db.load(), Snapshot::default());
        }

        it "returns None for unknown ids" {
            assert!(db.get_task("nope").is_none());
            assert!(db.get_feature("nope").is_none());
        }

        it "saves and reloads the whole document" {
            let snapshot = sample_snapshot();
            db.save(&snapshot).expect("Failed to save");

            let loaded = db.load();
            assert_eq!(loaded.features["F1"].tasks, vec!["T1", "T2"]);
            assert_eq!(loaded.tasks["T1"].result.as_deref(), Some("ok"));
            assert_eq!(loaded.tasks["T2"].status, TaskStatus::Pending);
            assert_eq!(db.get_task("T1").expect("task").status, TaskStatus::Completed);
            assert_eq!(db.get_feature("F1").expect("feature").progress, 50);
        }

        it "replaces rather than merges on save" {
            db.save(&sample_snapshot()).expect("Failed to save");

            let mut snapshot = db.load();
            snapshot.tasks.remove("T2");
            db.save(&snapshot).expect("Failed to save");

            assert!(db.get_task("T2").is_none());
            assert_eq!(db.load().tasks.len(), 1);
        }

        it "is shared between clones" {
            let other = db.clone();
            db.save(&sample_snapshot()).expect("Failed to save");

            assert!(other.get_feature("F1").is_some());
        }
    }

    describe "database mailbox" {
        it "drains messages in append order" {
            db.append(ORCHESTRATOR, message("T1", MessageKind::StatusUpdate)).expect("append");
            db.append(ORCHESTRATOR, message("T2", MessageKind::TaskCompleted)).expect("append");
            db.append("frontend", message("T3", MessageKind::NewTask)).expect("append");

            assert_eq!(db.pending_count(ORCHESTRATOR).expect("count"), 2);

            let drained = db.drain(ORCHESTRATOR).expect("drain");
            let ids: Vec<_> = drained.iter().map(|m| m.task_id.as_str()).collect();
            assert_eq!(ids, vec!["T1", "T2"]);
            assert_eq!(drained[1].kind, MessageKind::TaskCompleted);

            assert!(db.drain(ORCHESTRATOR).expect("drain").is_empty());
            assert_eq!(db.pending_count("frontend").expect("count"), 1);
        }

        it "returns nothing for an empty inbox" {
            assert!(db.drain("qa").expect("drain").is_empty());
            assert_eq!(db.pending_count("qa").expect("count"), 0);
        }
    }

    describe "on-disk stores" {
        it "reopens a database file with its state" {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("state.db");

            let first = Database::open(path.clone()).expect("open");
            first.migrate().expect("migrate");
            first.save(&sample_snapshot()).expect("save");
            drop(first);

            let second = Database::open(path).expect("open");
            second.migrate().expect("migrate");
            assert_eq!(second.load().tasks.len(), 2);
        }

        it "does not revive a row with an unknown status as pending" {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("state.db");
            let store = Database::open(path.clone()).expect("open");
            store.migrate().expect("migrate");
            store.save(&sample_snapshot()).expect("save");

            let raw = rusqlite::Connection::open(&path).expect("open raw");
            raw.execute("UPDATE tasks SET status = 'archived' WHERE id = 'T1'", [])
                .expect("corrupt status");

            assert!(store.get_task("T1").is_none());
            assert!(store.load().tasks.is_empty());
        }

        it "treats an unreadable timestamp as corruption" {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("state.db");
            let store = Database::open(path.clone()).expect("open");
            store.migrate().expect("migrate");
            store.save(&sample_snapshot()).expect("save");

            let raw = rusqlite::Connection::open(&path).expect("open raw");
            raw.execute("UPDATE tasks SET updated_at = 'yesterday' WHERE id = 'T2'", [])
                .expect("corrupt timestamp");

            assert!(store.get_task("T2").is_none());
            assert!(store.get_task("T1").is_some());
            assert_eq!(store.load(), Snapshot::default());
        }

        it "writes the state document as json" {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = JsonFileStore::new(dir.path().join("state.json"));
            store.save(&sample_snapshot()).expect("save");

            let raw = std::fs::read_to_string(store.path()).expect("read");
            let doc: serde_json::Value = serde_json::from_str(&raw).expect("json");
            assert_eq!(doc["tasks"]["T1"]["status"], "completed");
            assert_eq!(doc["features"]["F1"]["tasks"][1], "T2");
            assert_eq!(store.get_task("T2").expect("task").progress, 0);
        }
    }
}
