//! Worker core: the local task queue, the task executor, and the
//! reconciliation loops that keep the task store aligned with the container
//! runtime.

pub mod api;
pub mod stats;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use bollard::secret::{ContainerInspectResponse, ContainerStateStatusEnum};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::{MemoryStore, PersistentStore, Store, StoreError, StoreResult};
use crate::task::docker::{Docker, DockerError};
use crate::task::state::valid_state_transition;
use crate::task::{Config, State, Task};
use self::stats::{get_stats, Stats};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("task queue is empty")]
    QueueEmpty,

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: State, to: State },

    #[error("unexpected target state {0}")]
    UnexpectedState(State),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// A worker owns the runtime facts about its tasks: which container backs
/// each one, what ports it published, whether it is still alive.
pub struct Worker {
    pub name: String,
    queue: VecDeque<Task>,
    db: Box<dyn Store<Task> + Send + Sync>,
    stats: Option<Stats>,
    task_count: i64,
}

impl Worker {
    /// `db_type` is `memory` or `persistent`; a persistent worker keeps its
    /// tasks in `{name}_tasks.db`.
    pub fn new(name: &str, db_type: &str) -> WorkerResult<Self> {
        let db: Box<dyn Store<Task> + Send + Sync> = match db_type {
            "persistent" => {
                let filename = format!("{name}_tasks.db");
                Box::new(PersistentStore::open(Path::new(&filename), "tasks")?)
            }
            _ => Box::new(MemoryStore::new()),
        };

        Ok(Worker {
            name: name.to_string(),
            queue: VecDeque::new(),
            db,
            stats: None,
            task_count: 0,
        })
    }

    pub fn add_task(&mut self, task: Task) {
        self.queue.push_back(task);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        match self.db.list() {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "listing tasks failed");
                Vec::new()
            }
        }
    }

    pub fn task(&self, id: &Uuid) -> StoreResult<Task> {
        self.db.get(&id.to_string())
    }

    pub fn stats(&self) -> Option<Stats> {
        self.stats.clone()
    }

    /// Running task count as of the last stats collection pass.
    pub fn task_count(&self) -> i64 {
        self.task_count
    }

    /// Apply the next queued task against the runtime.
    ///
    /// The dequeued task carries the desired state; the store carries the
    /// last persisted one. An unknown task is persisted first so the
    /// legality check runs against a real baseline.
    pub async fn run_task(&mut self) -> WorkerResult<()> {
        let Some(queued) = self.queue.pop_front() else {
            return Err(WorkerError::QueueEmpty);
        };

        let key = queued.id.to_string();
        let persisted = match self.db.get(&key) {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                self.db.put(&key, queued.clone())?;
                queued.clone()
            }
            Err(e) => return Err(e.into()),
        };

        if !valid_state_transition(persisted.state, queued.state) {
            return Err(WorkerError::InvalidStateTransition {
                from: persisted.state,
                to: queued.state,
            });
        }

        match queued.state {
            State::Scheduled => self.start_task(queued).await,
            State::Completed => self.stop_task(queued).await,
            other => Err(WorkerError::UnexpectedState(other)),
        }
    }

    pub async fn start_task(&mut self, mut task: Task) -> WorkerResult<()> {
        let key = task.id.to_string();
        let run_result = match Docker::new(Config::from_task(&task)) {
            Ok(docker) => docker.run().await,
            Err(e) => Err(e),
        };

        match run_result {
            Ok(container_id) => {
                task.container_id = Some(container_id);
                task.start_time = Some(Utc::now());
                task.state = State::Running;
                self.db.put(&key, task.clone())?;
                info!(task_id = %task.id, container_id = ?task.container_id, "task running");
                Ok(())
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "starting task failed");
                task.state = State::Failed;
                self.db.put(&key, task)?;
                Err(e.into())
            }
        }
    }

    /// The task is persisted as `Completed` even when the driver fails, so
    /// it cannot linger as `Running` in the store.
    pub async fn stop_task(&mut self, mut task: Task) -> WorkerResult<()> {
        let mut stop_result = Ok(());
        match task.container_id.clone() {
            Some(container_id) => {
                let stopped = match Docker::new(Config::from_task(&task)) {
                    Ok(docker) => docker.stop(&container_id).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = stopped {
                    error!(%container_id, error = %e, "stopping container failed");
                    stop_result = Err(WorkerError::Docker(e));
                }
            }
            None => warn!(task_id = %task.id, "task has no container to stop"),
        }

        task.finish_time = Some(Utc::now());
        task.state = State::Completed;
        self.db.put(&task.id.to_string(), task.clone())?;
        info!(task_id = %task.id, container_id = ?task.container_id, "task stopped");

        stop_result
    }

    /// One reconciliation pass: inspect the container behind every
    /// `Running` task and repair the record.
    pub async fn update_tasks(&mut self) {
        for mut task in self.get_tasks() {
            if task.state != State::Running {
                continue;
            }

            let key = task.id.to_string();
            match self.inspect_task(&task).await {
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "container inspect failed");
                }
                Ok(None) => {
                    warn!(task_id = %task.id, "no container for running task");
                    task.state = State::Failed;
                    self.persist(&key, task);
                }
                Ok(Some(container)) => {
                    let status = container.state.and_then(|s| s.status);
                    if status == Some(ContainerStateStatusEnum::EXITED) {
                        warn!(task_id = %task.id, "container exited");
                        task.state = State::Failed;
                    } else {
                        task.host_ports = container.network_settings.and_then(|ns| ns.ports);
                    }
                    self.persist(&key, task);
                }
            }
        }
    }

    async fn inspect_task(&self, task: &Task) -> WorkerResult<Option<ContainerInspectResponse>> {
        let Some(container_id) = &task.container_id else {
            return Ok(None);
        };
        let docker = Docker::new(Config::from_task(task))?;
        Ok(docker.inspect(container_id).await?)
    }

    /// One stats collection pass: sample the host and stamp the running
    /// task count.
    pub fn collect_stats(&mut self) {
        let running = self
            .get_tasks()
            .iter()
            .filter(|t| t.state == State::Running)
            .count() as i64;
        self.task_count = running;

        let mut stats = get_stats();
        stats.task_count = running;
        self.stats = Some(stats);
    }

    fn persist(&mut self, key: &str, task: Task) {
        if let Err(e) = self.db.put(key, task) {
            error!(%key, error = %e, "persisting task failed");
        }
    }
}

/// Apply one queued task every ten seconds.
pub async fn run_tasks(worker: Arc<Mutex<Worker>>) {
    loop {
        {
            let mut guard = worker.lock().await;
            if guard.queue_len() > 0 {
                if let Err(e) = guard.run_task().await {
                    error!(error = %e, "running task failed");
                }
            } else {
                debug!("no tasks in queue");
            }
        }
        sleep(Duration::from_secs(10)).await;
    }
}

/// Publish a fresh stats snapshot every fifteen seconds.
pub async fn collect_stats(worker: Arc<Mutex<Worker>>) {
    loop {
        debug!("collecting stats");
        worker.lock().await.collect_stats();
        sleep(Duration::from_secs(15)).await;
    }
}

/// Reconcile running tasks against the container runtime every fifteen
/// seconds.
pub async fn update_tasks(worker: Arc<Mutex<Worker>>) {
    loop {
        debug!("checking container state of running tasks");
        worker.lock().await.update_tasks().await;
        sleep(Duration::from_secs(15)).await;
    }
}
