//! Command-line interface: the `manager` and `worker` server subcommands
//! plus the client subcommands that talk to a running manager.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use stevedore::manager::{self, api::ManagerServer, Manager};
use stevedore::node::Node;
use stevedore::task::Task;
use stevedore::worker::{self, api::TaskServer, Worker};

#[derive(Parser)]
#[command(name = "stevedore", about = "A minimal container orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a manager node.
    Manager {
        /// Address to listen on.
        #[arg(long, short = 'H', default_value = "0.0.0.0")]
        host: String,

        #[arg(long, short, default_value_t = 5555)]
        port: u16,

        /// Worker addresses (host:port), comma separated or repeated.
        #[arg(long, short, value_delimiter = ',', default_value = "localhost:5556")]
        workers: Vec<String>,

        /// Placement strategy: round_robin or e_pvm.
        #[arg(long, short, default_value = "e_pvm")]
        scheduler: String,

        /// Task and event storage: memory or persistent.
        #[arg(long, short, default_value = "memory")]
        db_type: String,
    },

    /// Start a worker node.
    Worker {
        /// Address to listen on.
        #[arg(long, short = 'H', default_value = "0.0.0.0")]
        host: String,

        #[arg(long, short, default_value_t = 5556)]
        port: u16,

        /// Worker name; generated when omitted.
        #[arg(long, short)]
        name: Option<String>,

        /// Task storage: memory or persistent.
        #[arg(long, short, default_value = "memory")]
        db_type: String,
    },

    /// Submit a task event file to a manager.
    Run {
        /// File holding the JSON task event.
        #[arg(long, short, default_value = "task.json")]
        filename: String,

        /// Manager address (host:port).
        #[arg(long, short, default_value = "localhost:5555")]
        manager: String,
    },

    /// Stop a task.
    Stop {
        task_id: String,

        /// Manager address (host:port).
        #[arg(long, short, default_value = "localhost:5555")]
        manager: String,
    },

    /// List the tasks known to a manager.
    Status {
        /// Manager address (host:port).
        #[arg(long, short, default_value = "localhost:5555")]
        manager: String,
    },

    /// List the worker nodes registered with a manager.
    Node {
        /// Manager address (host:port).
        #[arg(long, short, default_value = "localhost:5555")]
        manager: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Manager {
                host,
                port,
                workers,
                scheduler,
                db_type,
            } => run_manager(host, port, workers, scheduler, db_type).await,
            Command::Worker {
                host,
                port,
                name,
                db_type,
            } => run_worker(host, port, name, db_type).await,
            Command::Run { filename, manager } => run_task_file(filename, manager).await,
            Command::Stop { task_id, manager } => stop_task(task_id, manager).await,
            Command::Status { manager } => status(manager).await,
            Command::Node { manager } => nodes(manager).await,
        }
    }
}

async fn run_manager(
    host: String,
    port: u16,
    workers: Vec<String>,
    scheduler: String,
    db_type: String,
) -> Result<()> {
    info!(?workers, %scheduler, %db_type, "starting manager");
    let m = Manager::new(workers, &scheduler, &db_type).context("creating manager")?;
    let m = Arc::new(Mutex::new(m));

    tokio::spawn(manager::process_tasks(m.clone()));
    tokio::spawn(manager::update_tasks(m.clone()));
    tokio::spawn(manager::do_health_checks(m.clone()));

    ManagerServer::new(m, &host, port)
        .start()
        .await
        .context("serving manager API")?;
    Ok(())
}

async fn run_worker(host: String, port: u16, name: Option<String>, db_type: String) -> Result<()> {
    let name = name.unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
    info!(%name, %db_type, "starting worker");
    let w = Worker::new(&name, &db_type).context("creating worker")?;
    let w = Arc::new(Mutex::new(w));

    tokio::spawn(worker::run_tasks(w.clone()));
    tokio::spawn(worker::collect_stats(w.clone()));
    tokio::spawn(worker::update_tasks(w.clone()));

    TaskServer::new(w, &host, port)
        .start()
        .await
        .context("serving worker API")?;
    Ok(())
}

async fn run_task_file(filename: String, manager: String) -> Result<()> {
    let body = std::fs::read_to_string(&filename)
        .with_context(|| format!("reading task file {filename}"))?;

    let url = format!("http://{manager}/tasks");
    let resp = reqwest::Client::new()
        .post(&url)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .with_context(|| format!("connecting to manager at {manager}"))?;

    if resp.status() != StatusCode::CREATED {
        bail!("manager answered {}: {}", resp.status(), resp.text().await?);
    }

    let task: Task = resp.json().await.context("decoding created task")?;
    println!("task {} submitted", task.id);
    Ok(())
}

async fn stop_task(task_id: String, manager: String) -> Result<()> {
    let url = format!("http://{manager}/tasks/{task_id}");
    let resp = reqwest::Client::new()
        .delete(&url)
        .send()
        .await
        .with_context(|| format!("connecting to manager at {manager}"))?;

    if resp.status() != StatusCode::NO_CONTENT {
        bail!("manager answered {}", resp.status());
    }

    println!("task {task_id} stopping");
    Ok(())
}

async fn status(manager: String) -> Result<()> {
    let url = format!("http://{manager}/tasks");
    let tasks: Vec<Task> = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("connecting to manager at {manager}"))?
        .json()
        .await
        .context("decoding task list")?;

    println!(
        "{:<38} {:<20} {:<12} {:<11} {:<14} IMAGE",
        "TASK ID", "NAME", "CREATED", "STATE", "CONTAINER ID"
    );
    for task in tasks {
        let container = task
            .container_id
            .as_deref()
            .map(|id| id.chars().take(12).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<20} {:<12} {:<11} {:<14} {}",
            task.id,
            task.name,
            format_age(task.start_time),
            task.state.to_string(),
            container,
            task.image,
        );
    }
    Ok(())
}

async fn nodes(manager: String) -> Result<()> {
    let url = format!("http://{manager}/nodes");
    let nodes: Vec<Node> = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("connecting to manager at {manager}"))?
        .json()
        .await
        .context("decoding node list")?;

    println!(
        "{:<24} {:<12} {:<10} {:<8} TASKS",
        "NAME", "MEMORY(MiB)", "DISK(GiB)", "ROLE"
    );
    for node in nodes {
        println!(
            "{:<24} {:<12} {:<10} {:<8} {}",
            node.name,
            node.memory / 1024,
            node.disk / 1_000_000_000,
            node.role,
            node.task_count,
        );
    }
    Ok(())
}

fn format_age(ts: Option<DateTime<Utc>>) -> String {
    let Some(ts) = ts else {
        return "-".to_string();
    };
    let secs = (Utc::now() - ts).num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}
