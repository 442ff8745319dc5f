use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crewledger::api::{self, AppState};
use crewledger::config::{LedgerConfig, StateBackend};
use crewledger::db::Database;
use crewledger::dispatch::{AgentRegistry, Dispatcher, Mailbox};
use crewledger::lifecycle::TaskLifecycle;
use crewledger::models::*;
use crewledger::monitor::Monitor;
use crewledger::recovery::RecoveryEngine;
use crewledger::render;
use crewledger::store::{JsonFileStore, StateStore};

#[derive(Parser)]
#[command(name = "crew")]
#[command(about = "Task lifecycle, health and recovery for multi-agent development crews")]
struct Cli {
    /// Config file (defaults to $CREW_CONFIG, then the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage features
    #[command(subcommand)]
    Feature(FeatureCommand),
    /// Create a feature and its tasks from a JSON plan file
    Plan { file: PathBuf },
    /// Manage tasks and report on them
    #[command(subcommand)]
    Task(TaskCommand),
    /// Show the health report
    Health,
    /// Run recovery actions
    #[command(subcommand)]
    Recover(RecoverCommand),
    /// Show per-agent workload and pending tasks
    Agents,
    /// Show task statistics
    Stats,
    /// Hand pending tasks to agents with free capacity
    Dispatch,
    /// Run the monitor loop in the foreground
    Watch {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },
    /// Start the HTTP API with the monitor loop in the background
    Serve {
        /// Port for HTTP API
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Delete all features and tasks
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum FeatureCommand {
    Create {
        description: String,
        #[arg(long)]
        id: Option<String>,
    },
    List,
    Show { id: String },
}

#[derive(Subcommand)]
enum TaskCommand {
    Add {
        feature_id: String,
        agent: String,
        description: String,
        #[arg(long)]
        id: Option<String>,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Show { id: String },
    Start { id: String },
    Progress {
        id: String,
        #[arg(allow_hyphen_values = true)]
        progress: i64,
    },
    Complete {
        id: String,
        #[arg(long)]
        result: Option<String>,
    },
    Fail { id: String, error: String },
    Retry { id: String },
    /// Assign a pending task to its agent now
    Assign { id: String },
}

#[derive(Subcommand)]
enum RecoverCommand {
    /// Requeue tasks in progress for longer than the timeout
    Stalled {
        /// Minutes
        #[arg(long)]
        timeout: Option<i64>,
    },
    /// Requeue failed tasks with retries left
    Retry {
        #[arg(long)]
        retries: Option<u32>,
    },
    /// Remove finished tasks older than the retention window
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Health check, then every recovery action
    Full,
}

/// Initialize tracing on stderr so command output on stdout stays clean
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "crewledger=info,tower_http=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Wire the store, mailbox and agent registry described by `config`.
fn open_state(config: &LedgerConfig) -> anyhow::Result<AppState> {
    let (store, mailbox): (Arc<dyn StateStore>, Database) = match config.state_backend {
        StateBackend::Json => {
            let mailbox = Database::open(config.mailbox_path())?;
            mailbox.migrate()?;
            (Arc::new(JsonFileStore::new(config.state_path())), mailbox)
        }
        StateBackend::Sqlite => {
            let db = Database::open(config.state_path())?;
            db.migrate()?;
            (Arc::new(db.clone()), db)
        }
    };
    tracing::debug!(
        "Using {} state at {}",
        config.state_backend.as_str(),
        config.state_path().display()
    );

    let mailbox: Arc<dyn Mailbox> = Arc::new(mailbox);
    let lifecycle = TaskLifecycle::new(store, config.retry_policy());
    let recovery = RecoveryEngine::new(lifecycle.clone(), config.recovery_policy());
    let dispatcher = Dispatcher::new(
        lifecycle.clone(),
        AgentRegistry::with_mailbox(mailbox.clone()),
        mailbox,
        config.max_concurrent_tasks_per_agent,
    );

    Ok(AppState {
        lifecycle,
        recovery,
        dispatcher,
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome(outcome: &TransitionOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(outcome);
    }
    match outcome {
        TransitionOutcome::Applied(task) => {
            println!("Task {} is {} ({}%)", task.id, task.status, task.progress)
        }
        TransitionOutcome::Ignored { task, reason } => {
            println!("Task {} unchanged: {}", task.id, reason)
        }
        TransitionOutcome::NotFound => anyhow::bail!("Task not found"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = LedgerConfig::load(cli.config.as_deref())?;
    let state = open_state(&config)?;
    let json = cli.json;

    match cli.command {
        Commands::Feature(cmd) => match cmd {
            FeatureCommand::Create { description, id } => {
                let feature = state
                    .lifecycle
                    .create_feature(CreateFeatureInput { id, description })?;
                if json {
                    print_json(&feature)?;
                } else {
                    println!("Created feature {}", feature.id);
                }
            }
            FeatureCommand::List => {
                let features = state.lifecycle.list_features();
                if json {
                    print_json(&features)?;
                } else {
                    let (active, total) = state.lifecycle.active_features_count();
                    println!("{} of {} features active\n", active, total);
                    print!("{}", render::render_features(&features, Utc::now()));
                }
            }
            FeatureCommand::Show { id } => {
                let fp = state
                    .lifecycle
                    .feature_progress(&id)
                    .with_context(|| format!("Feature not found: {}", id))?;
                if json {
                    print_json(&fp)?;
                } else {
                    print!("{}", render::render_features(&[fp], Utc::now()));
                }
            }
        },
        Commands::Plan { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let plan: FeaturePlan = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let fp = state.lifecycle.create_plan(plan)?;
            if json {
                print_json(&fp)?;
            } else {
                println!(
                    "Created feature {} with {} tasks",
                    fp.feature.id,
                    fp.tasks.len()
                );
            }
        }
        Commands::Task(cmd) => match cmd {
            TaskCommand::Add {
                feature_id,
                agent,
                description,
                id,
            } => {
                let task = state.lifecycle.create_task(
                    &feature_id,
                    CreateTaskInput {
                        id,
                        description,
                        agent,
                    },
                )?;
                if json {
                    print_json(&task)?;
                } else {
                    println!("Created task {} for {}", task.id, task.assigned_agent);
                }
            }
            TaskCommand::List { status } => {
                let status = match status.as_deref() {
                    Some(s) => Some(
                        TaskStatus::from_str(s)
                            .with_context(|| format!("Unknown task status: {}", s))?,
                    ),
                    None => None,
                };
                let tasks = state.lifecycle.list_tasks(status);
                if json {
                    print_json(&tasks)?;
                } else {
                    for task in &tasks {
                        println!(
                            "{:<38} {:<19} {:<12} {:>3}%  {}",
                            task.id, task.status, task.assigned_agent, task.progress, task.description
                        );
                    }
                }
            }
            TaskCommand::Show { id } => {
                let task = state
                    .lifecycle
                    .get_task(&id)
                    .with_context(|| format!("Task not found: {}", id))?;
                if json {
                    print_json(&task)?;
                } else {
                    print!("{}", render::render_task(&task));
                }
            }
            TaskCommand::Start { id } => print_outcome(&state.lifecycle.start(&id)?, json)?,
            TaskCommand::Progress { id, progress } => {
                print_outcome(&state.lifecycle.update_progress(&id, progress)?, json)?
            }
            TaskCommand::Complete { id, result } => {
                print_outcome(&state.lifecycle.complete(&id, result)?, json)?
            }
            TaskCommand::Fail { id, error } => {
                print_outcome(&state.lifecycle.fail(&id, error)?, json)?
            }
            TaskCommand::Retry { id } => print_outcome(&state.lifecycle.retry(&id)?, json)?,
            TaskCommand::Assign { id } => print_outcome(&state.dispatcher.assign(&id)?, json)?,
        },
        Commands::Health => {
            let report = state.recovery.health_check();
            if json {
                print_json(&report)?;
            } else {
                print!("{}", render::render_health(&report));
            }
        }
        Commands::Recover(cmd) => {
            let policy = state.recovery.policy();
            match cmd {
                RecoverCommand::Stalled { timeout } => {
                    let timeout = timeout.unwrap_or(policy.stall_timeout_minutes);
                    let recovered = state.recovery.recover_stalled_tasks(timeout)?;
                    if json {
                        print_json(&recovered)?;
                    } else {
                        println!("Recovered {} stalled tasks", recovered.len());
                        for id in &recovered {
                            println!("  - {}", id);
                        }
                    }
                }
                RecoverCommand::Retry { retries } => {
                    let summary = state
                        .recovery
                        .retry_failed_tasks(retries.unwrap_or(policy.max_retries))?;
                    if json {
                        print_json(&summary)?;
                    } else {
                        println!(
                            "Retried {} failed tasks, {} permanently failed",
                            summary.retried.len(),
                            summary.exhausted.len()
                        );
                    }
                }
                RecoverCommand::Cleanup { days } => {
                    let removed = state
                        .recovery
                        .cleanup_completed_tasks(days.unwrap_or(policy.retention_days))?;
                    if json {
                        print_json(&removed)?;
                    } else {
                        println!("Cleaned up {} old tasks", removed);
                    }
                }
                RecoverCommand::Full => {
                    let summary = state.recovery.full_recovery()?;
                    if json {
                        print_json(&summary)?;
                    } else {
                        print!("{}", render::render_recovery(&summary));
                    }
                }
            }
        }
        Commands::Agents => {
            let workloads = state.recovery.agent_workloads();
            if json {
                print_json(&workloads)?;
            } else {
                print!("{}", render::render_workloads(&workloads));
            }
        }
        Commands::Stats => {
            let stats = state.recovery.statistics();
            if json {
                print_json(&stats)?;
            } else {
                print!("{}", render::render_statistics(&stats));
            }
        }
        Commands::Dispatch => {
            let summary = state.dispatcher.dispatch_pending()?;
            if json {
                print_json(&summary)?;
            } else {
                print!("{}", render::render_dispatch(&summary));
            }
        }
        Commands::Watch { once } => {
            let monitor = Monitor::new(state.recovery.clone(), state.dispatcher.clone(), &config);
            if once {
                let report = monitor.tick()?;
                if json {
                    print_json(&report)?;
                } else {
                    print!("{}", render::render_health(&report.health));
                    if let Some(recovery) = &report.recovery {
                        print!("{}", render::render_recovery(recovery));
                    }
                    print!("{}", render::render_dispatch(&report.dispatch));
                }
            } else {
                monitor
                    .run(shutdown_signal(), |report| {
                        print!("{}", render::render_health(&report.health));
                        if let Some(recovery) = report.recovery.as_ref().filter(|r| !r.skipped) {
                            print!("{}", render::render_recovery(recovery));
                        }
                        if !report.dispatch.assigned.is_empty() {
                            print!("{}", render::render_dispatch(&report.dispatch));
                        }
                    })
                    .await;
            }
        }
        Commands::Serve { port } => {
            tracing::info!("Starting crewledger server on port {}", port);

            let monitor = Monitor::new(state.recovery.clone(), state.dispatcher.clone(), &config);
            let monitor_task = tokio::spawn(monitor.run(shutdown_signal(), |_| {}));

            let app = api::create_router(state);
            let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
            tracing::info!("crewledger listening on http://127.0.0.1:{}", port);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
            monitor_task.await?;
        }
        Commands::Reset { yes } => {
            if !yes {
                anyhow::bail!("Refusing to reset without --yes");
            }
            state.lifecycle.reset()?;
            println!("Ledger reset");
        }
    }

    Ok(())
}
