use std::sync::Arc;

use crewledger::db::Database;
use crewledger::dispatch::*;
use crewledger::lifecycle::{RetryPolicy, TaskLifecycle};
use crewledger::models::*;
use speculate2::speculate;

/// An agent that refuses every assignment.
struct OfflineAgent(AgentKind);

impl AgentHandler for OfflineAgent {
    fn kind(&self) -> AgentKind {
        self.0
    }

    fn accept_task(&self, _assignment: &TaskAssignment) -> anyhow::Result<()> {
        anyhow::bail!("agent offline")
    }

    fn report_progress(&self, _report: &StatusReport) -> anyhow::Result<()> {
        anyhow::bail!("agent offline")
    }
}

fn seed(lifecycle: &TaskLifecycle, tasks: &[(&str, &str)]) {
    lifecycle
        .create_plan(FeaturePlan {
            id: Some("F1".to_string()),
            description: "Search".to_string(),
            tasks: tasks
                .iter()
                .map(|(id, agent)| CreateTaskInput {
                    id: Some(id.to_string()),
                    description: format!("Task {}", id),
                    agent: agent.to_string(),
                })
                .collect(),
        })
        .expect("Failed to create plan");
}

fn status(lifecycle: &TaskLifecycle, id: &str) -> TaskStatus {
    lifecycle.get_task(id).expect("task").status
}

speculate! {
    before {
        let db = Database::open_memory().expect("Failed to create in-memory database");
        db.migrate().expect("Failed to run migrations");
        let lifecycle = TaskLifecycle::new(Arc::new(db.clone()), RetryPolicy::default());
        let mailbox: Arc<dyn Mailbox> = Arc::new(db.clone());
        let registry = AgentRegistry::with_mailbox(mailbox.clone());
        let dispatcher = Dispatcher::new(lifecycle.clone(), registry, mailbox.clone(), 1);
    }

    describe "dispatch_pending" {
        it "assigns the oldest pending task per agent and defers the rest" {
            seed(&lifecycle, &[("T1", "frontend"), ("T2", "frontend"), ("T3", "backend")]);

            let summary = dispatcher.dispatch_pending().expect("dispatch");

            assert_eq!(summary.assigned, vec!["T1", "T3"]);
            assert_eq!(summary.deferred, vec!["T2"]);
            assert_eq!(status(&lifecycle, "T1"), TaskStatus::InProgress);
            assert_eq!(status(&lifecycle, "T2"), TaskStatus::Pending);
            assert_eq!(dispatcher.capacity(AgentKind::Frontend), 0);
            assert_eq!(dispatcher.capacity(AgentKind::Qa), 1);
        }

        it "delivers a new_task message to the agent inbox" {
            seed(&lifecycle, &[("T1", "db")]);

            dispatcher.dispatch_pending().expect("dispatch");

            let messages = mailbox.drain("db").expect("drain");
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].kind, MessageKind::NewTask);
            assert_eq!(messages[0].task_id, "T1");
            assert_eq!(messages[0].feature_id.as_deref(), Some("F1"));
            assert_eq!(messages[0].content.as_deref(), Some("Task T1"));
        }

        it "marks retried work as recovered" {
            seed(&lifecycle, &[("T1", "qa")]);
            lifecycle.fail("T1", "flaky").expect("fail");
            lifecycle.retry("T1").expect("retry");

            dispatcher.dispatch_pending().expect("dispatch");

            let messages = mailbox.drain("qa").expect("drain");
            assert_eq!(messages[0].kind, MessageKind::RecoveredTask);
        }

        it "frees capacity when a task completes" {
            seed(&lifecycle, &[("T1", "frontend"), ("T2", "frontend")]);
            dispatcher.dispatch_pending().expect("dispatch");
            lifecycle.complete("T1", None).expect("complete");

            let summary = dispatcher.dispatch_pending().expect("dispatch");

            assert_eq!(summary.assigned, vec!["T2"]);
        }

        it "requeues a task its agent refuses" {
            let mut registry = AgentRegistry::with_mailbox(mailbox.clone());
            registry.register(Arc::new(OfflineAgent(AgentKind::Security)));
            let dispatcher = Dispatcher::new(lifecycle.clone(), registry, mailbox.clone(), 1);
            seed(&lifecycle, &[("T1", "security")]);

            let summary = dispatcher.dispatch_pending().expect("dispatch");

            assert!(summary.assigned.is_empty());
            assert_eq!(summary.deferred, vec!["T1"]);
            let t = lifecycle.get_task("T1").expect("task");
            assert_eq!(t.status, TaskStatus::Pending);
            assert!(t.started_at.is_none());
            assert!(t.last_error.as_deref().unwrap_or_default().contains("agent offline"));
        }

        it "reports tasks whose agent has no handler" {
            let dispatcher = Dispatcher::new(lifecycle.clone(), AgentRegistry::new(), mailbox.clone(), 1);
            seed(&lifecycle, &[("T1", "docs")]);

            let summary = dispatcher.dispatch_pending().expect("dispatch");

            assert_eq!(summary.unroutable, vec!["T1"]);
            assert_eq!(status(&lifecycle, "T1"), TaskStatus::Pending);
        }
    }

    describe "assign" {
        it "respects the agent's capacity" {
            seed(&lifecycle, &[("T1", "backend"), ("T2", "backend")]);
            assert!(dispatcher.assign("T1").expect("assign").is_applied());

            let outcome = dispatcher.assign("T2").expect("assign");

            assert!(matches!(outcome, TransitionOutcome::Ignored { .. }));
            assert_eq!(status(&lifecycle, "T2"), TaskStatus::Pending);
        }

        it "ignores tasks that are not pending" {
            seed(&lifecycle, &[("T1", "backend")]);
            lifecycle.complete("T1", None).expect("complete");

            assert!(!dispatcher.assign("T1").expect("assign").is_applied());
            assert_eq!(dispatcher.assign("ghost").expect("assign"), TransitionOutcome::NotFound);
        }
    }

    describe "reports" {
        it "applies agent reports through the lifecycle" {
            seed(&lifecycle, &[("T1", "frontend"), ("T2", "backend")]);
            dispatcher.dispatch_pending().expect("dispatch");

            let frontend = MailboxAgent::new(AgentKind::Frontend, mailbox.clone());
            let backend = MailboxAgent::new(AgentKind::Backend, mailbox.clone());
            frontend.report_progress(&StatusReport::Progress {
                task_id: "T1".to_string(),
                progress: 60,
                message: None,
            }).expect("report");
            backend.report_progress(&StatusReport::Failed {
                task_id: "T2".to_string(),
                error: "migration conflict".to_string(),
            }).expect("report");

            let summary = dispatcher.process_reports().expect("process");

            assert_eq!(summary, ReportSummary { applied: 2, ignored: 0, not_found: 0 });
            assert_eq!(lifecycle.get_task("T1").expect("task").progress, 60);
            assert_eq!(status(&lifecycle, "T2"), TaskStatus::Failed);
            assert_eq!(mailbox.pending_count(ORCHESTRATOR).expect("count"), 0);
        }

        it "tolerates duplicate and out-of-order reports" {
            seed(&lifecycle, &[("T1", "frontend")]);
            dispatcher.dispatch_pending().expect("dispatch");

            let agent = MailboxAgent::new(AgentKind::Frontend, mailbox.clone());
            let completed = StatusReport::Completed {
                task_id: "T1".to_string(),
                result: Some("shipped".to_string()),
            };
            agent.report_progress(&completed).expect("report");
            agent.report_progress(&completed).expect("report");
            agent.report_progress(&StatusReport::Progress {
                task_id: "T1".to_string(),
                progress: 30,
                message: None,
            }).expect("report");
            agent.report_progress(&StatusReport::Completed {
                task_id: "ghost".to_string(),
                result: None,
            }).expect("report");

            let summary = dispatcher.process_reports().expect("process");

            assert_eq!(summary, ReportSummary { applied: 1, ignored: 2, not_found: 1 });
            let t = lifecycle.get_task("T1").expect("task");
            assert_eq!(t.status, TaskStatus::Completed);
            assert_eq!(t.progress, 100);
            assert_eq!(t.result.as_deref(), Some("shipped"));
            assert_eq!(lifecycle.get_feature("F1").expect("feature").status, FeatureStatus::Completed);
        }

        it "handles a report posted directly" {
            seed(&lifecycle, &[("T1", "ux_ui")]);

            let outcome = dispatcher.handle_report(&StatusReport::Progress {
                task_id: "T1".to_string(),
                progress: 120,
                message: Some("almost".to_string()),
            }).expect("report");

            let task = outcome.task().expect("task");
            assert_eq!(task.status, TaskStatus::InProgress);
            assert_eq!(task.progress, 100);
        }
    }

    describe "memory mailbox" {
        it "drives the same flow without a database" {
            let mailbox: Arc<dyn Mailbox> = Arc::new(MemoryMailbox::new());
            let dispatcher = Dispatcher::new(
                lifecycle.clone(),
                AgentRegistry::with_mailbox(mailbox.clone()),
                mailbox.clone(),
                2,
            );
            seed(&lifecycle, &[("T1", "devops"), ("T2", "devops"), ("T3", "devops")]);

            let summary = dispatcher.dispatch_pending().expect("dispatch");

            assert_eq!(summary.assigned.len(), 2);
            assert_eq!(mailbox.pending_count("devops").expect("count"), 2);
        }
    }
}
