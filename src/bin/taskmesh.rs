//! taskmesh CLI: run the scheduler, or operate on workers and tasks.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskmesh::clock::SystemClock;
use taskmesh::config::{Config, SchedulerConfig};
use taskmesh::db::Db;
use taskmesh::engine::Coordinator;
use taskmesh::model::{NewTask, Priority, Task, TaskId, TaskStatus, WorkerRegistration};
use taskmesh::store::{MemoryStore, Store};
use taskmesh::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "taskmesh", about = "Priority task dispatch for worker fleets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, heartbeat monitor and timeout monitor
    Serve {
        /// Keep all state in memory instead of Postgres
        #[arg(long)]
        memory: bool,
        /// Scheduler tunables (TOML); overrides TASKMESH_CONFIG
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Worker operations
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Queue and fleet counters
    Status,
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Register (or re-register) a worker
    Register {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "type", default_value = "general")]
        worker_type: String,
        /// Declared capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Send a heartbeat for a worker
    Heartbeat { id: String },
    /// List all workers
    List,
    /// Show one worker
    Show { id: String },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a pending task
    Create {
        task_type: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// low | medium | high | critical
        #[arg(long, default_value = "medium")]
        priority: Priority,
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Required worker capability (repeatable)
        #[arg(long = "require")]
        requires: Vec<String>,
    },
    /// Show a task (full id or unique prefix)
    Show { id: String },
    /// List tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Pending tasks in dispatch order
    Pending,
    /// Acknowledge an assigned task on behalf of its worker
    Start { id: String, worker: String },
    /// Mark a task completed
    Complete {
        id: String,
        /// JSON result
        #[arg(long)]
        result: Option<String>,
    },
    /// Mark a task failed
    Fail { id: String, error: String },
    /// Cancel a task
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            memory,
            config: path,
        } => cmd_serve(config, memory, path).await,
        Command::Worker { action } => cmd_worker(&connect(&config).await?, action).await,
        Command::Task { action } => cmd_task(&connect(&config).await?, action).await,
        Command::Status => cmd_status(&connect(&config).await?).await,
    }
}

/// A coordinator over Postgres for one-shot commands. Its loops never run.
async fn connect(config: &Config) -> anyhow::Result<Coordinator> {
    let scheduler_config = config.load_scheduler_config()?;
    let db = Db::connect(config.require_database_url()?.expose_secret()).await?;
    db.migrate().await?;
    Ok(Coordinator::new(
        Arc::new(db),
        Arc::new(SystemClock),
        scheduler_config,
    )?)
}

async fn cmd_serve(config: Config, memory: bool, path: Option<PathBuf>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "taskmesh".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let scheduler_config = match path {
        Some(path) => SchedulerConfig::load(&path)?,
        None => config.load_scheduler_config()?,
    };

    let db = if memory {
        None
    } else {
        let db = Db::connect(config.require_database_url()?.expose_secret()).await?;
        db.migrate().await?;
        Some(Arc::new(db))
    };
    let store: Arc<dyn Store> = match &db {
        Some(db) => Arc::clone(db) as Arc<dyn Store>,
        None => Arc::new(MemoryStore::new()),
    };

    let coordinator = Arc::new(Coordinator::new(
        store,
        Arc::new(SystemClock),
        scheduler_config,
    )?);

    if let Some(db) = db {
        let waker = coordinator.queue().waker();
        let shutdown = coordinator.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = db.forward_task_ready(waker, shutdown).await {
                tracing::warn!(error = %e, "task notifications unavailable, relying on polling");
            }
        });
    }

    let ctrl = Arc::clone(&coordinator);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested");
        ctrl.shutdown();
    });

    coordinator.run().await?;
    Ok(())
}

async fn cmd_worker(coordinator: &Coordinator, action: WorkerAction) -> anyhow::Result<()> {
    match action {
        WorkerAction::Register {
            id,
            name,
            worker_type,
            capabilities,
        } => {
            let name = name.unwrap_or_else(|| id.clone());
            let registration =
                WorkerRegistration::new(id, name, worker_type).capabilities(capabilities);
            let worker = coordinator.register_worker(registration).await?;
            println!("Registered: {} ({})", worker.id, worker.status);
        }
        WorkerAction::Heartbeat { id } => {
            let worker = coordinator.heartbeat(&id).await?;
            println!("Heartbeat: {} at {}", worker.id, worker.last_heartbeat);
        }
        WorkerAction::List => {
            let workers = coordinator.list_workers().await?;
            if workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!(
                "{:<20}  {:<12}  {:<8}  {:<8}  {:<20}  CAPABILITIES",
                "ID", "TYPE", "STATUS", "TASK", "LAST HEARTBEAT"
            );
            println!("{}", "-".repeat(100));
            for worker in &workers {
                let task = worker
                    .current_task
                    .map(|t| short_id(&t))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20}  {:<12}  {:<8}  {:<8}  {:<20}  {}",
                    worker.id,
                    worker.worker_type,
                    worker.status,
                    task,
                    worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S"),
                    worker.capabilities.join(",")
                );
            }
            println!("\n{} worker(s)", workers.len());
        }
        WorkerAction::Show { id } => {
            let worker = coordinator.get_worker(&id).await?;
            println!("{}", serde_json::to_string_pretty(&worker)?);
        }
    }
    Ok(())
}

async fn cmd_task(coordinator: &Coordinator, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Create {
            task_type,
            payload,
            priority,
            timeout,
            max_retries,
            requires,
        } => {
            let mut new = NewTask::new(task_type).priority(priority);
            if let Some(json) = payload {
                new = new.payload(serde_json::from_str(&json)?);
            }
            if let Some(secs) = timeout {
                new = new.timeout(Duration::from_secs(secs));
            }
            if let Some(n) = max_retries {
                new = new.max_retries(n);
            }
            for cap in requires {
                new = new.require(cap);
            }
            let id = coordinator.create_task(new).await?;
            println!("Created: {id}");
        }
        TaskAction::Show { id } => {
            let id = resolve_task_id(coordinator, &id).await?;
            let task = coordinator.get_task(id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskAction::List { status } => {
            print_tasks(&coordinator.list_tasks(status).await?);
        }
        TaskAction::Pending => {
            print_tasks(&coordinator.list_pending_tasks().await?);
        }
        TaskAction::Start { id, worker } => {
            let id = resolve_task_id(coordinator, &id).await?;
            let task = coordinator.start_task(id, &worker).await?;
            println!("Started: {} on {}", task.id, worker);
        }
        TaskAction::Complete { id, result } => {
            let id = resolve_task_id(coordinator, &id).await?;
            let result = match result {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::Value::Null,
            };
            let task = coordinator.complete_task(id, result).await?;
            println!("Completed: {}", task.id);
        }
        TaskAction::Fail { id, error } => {
            let id = resolve_task_id(coordinator, &id).await?;
            let task = coordinator.fail_task(id, &error).await?;
            println!("Failed: {}", task.id);
        }
        TaskAction::Cancel { id } => {
            let id = resolve_task_id(coordinator, &id).await?;
            let task = coordinator.cancel_task(id).await?;
            println!("Cancelled: {}", task.id);
        }
    }
    Ok(())
}

async fn cmd_status(coordinator: &Coordinator) -> anyhow::Result<()> {
    let status = coordinator.system_status().await?;
    println!("Pending tasks:   {}", status.pending_count);
    println!("Active tasks:    {}", status.active_task_count);
    println!("Active workers:  {}", status.active_worker_count);
    Ok(())
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }
    println!(
        "{:<8}  {:<16}  {:<11}  {:<8}  {:<5}  {:<20}  CREATED",
        "ID", "TYPE", "STATUS", "PRIORITY", "TRIES", "WORKER"
    );
    println!("{}", "-".repeat(100));
    for task in tasks {
        println!(
            "{:<8}  {:<16}  {:<11}  {:<8}  {:<5}  {:<20}  {}",
            short_id(&task.id),
            task.task_type,
            task.status,
            task.priority,
            format!("{}/{}", task.retry_count, task.max_retries),
            task.assigned_worker.as_deref().unwrap_or("-"),
            task.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} task(s)", tasks.len());
}

fn short_id(id: &TaskId) -> String {
    id.to_string()[..8].to_string()
}

/// Accept a full task id or a unique prefix of one.
async fn resolve_task_id(coordinator: &Coordinator, id: &str) -> anyhow::Result<TaskId> {
    if let Ok(id) = id.parse() {
        return Ok(id);
    }
    let tasks = coordinator.list_tasks(None).await?;
    let matches: Vec<_> = tasks
        .iter()
        .filter(|task| task.id.to_string().starts_with(id))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no task matching '{id}'"),
        [task] => Ok(task.id),
        _ => anyhow::bail!("{} tasks match prefix '{id}', be more specific", matches.len()),
    }
}
