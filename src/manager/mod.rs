//! Manager core: the pending event queue, the event-to-placement pipeline,
//! and the reconciliation and health-check passes that keep the manager's
//! records in agreement with its workers.

pub mod api;

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::node::Node;
use crate::scheduler::{EPvm, RoundRobin, Scheduler, SchedulerError};
use crate::store::{MemoryStore, PersistentStore, Store, StoreError, StoreResult};
use crate::task::state::valid_state_transition;
use crate::task::{Event, State, Task};
use crate::worker::api::ErrResponse;

/// Automatic restarts stop once a task has failed this many times.
const MAX_RESTARTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("worker answered {code}: {message}")]
    Api { code: u16, message: String },

    #[error("no worker mapped for task {0}")]
    UnmappedTask(Uuid),

    #[error("task {0} has no published host port")]
    NoHostPort(Uuid),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// The manager owns the desired side of every task and the bookkeeping
/// that ties tasks to workers. Handlers and loops share it behind one
/// mutex; the maps are never exposed directly.
pub struct Manager {
    pending: VecDeque<Event>,
    task_db: Box<dyn Store<Task> + Send + Sync>,
    event_db: Box<dyn Store<Event> + Send + Sync>,
    workers: Vec<String>,
    worker_task_map: HashMap<String, Vec<Uuid>>,
    task_worker_map: HashMap<Uuid, String>,
    worker_nodes: Vec<Node>,
    scheduler: Box<dyn Scheduler + Send + Sync>,
    client: reqwest::Client,
}

impl Manager {
    /// `scheduler_type` is `round_robin` or `e_pvm` (the default);
    /// `db_type` is `memory` or `persistent`. A store that cannot be
    /// opened is fatal at startup.
    pub fn new(workers: Vec<String>, scheduler_type: &str, db_type: &str) -> ManagerResult<Self> {
        let mut worker_task_map = HashMap::new();
        let mut worker_nodes = Vec::new();
        for worker in &workers {
            worker_task_map.insert(worker.clone(), Vec::new());
            let api = format!("http://{worker}");
            worker_nodes.push(Node::new(worker, &api, "worker"));
        }

        let scheduler: Box<dyn Scheduler + Send + Sync> = match scheduler_type {
            "round_robin" => Box::new(RoundRobin::default()),
            _ => Box::new(EPvm),
        };

        let (task_db, event_db): (Box<dyn Store<Task> + Send + Sync>, Box<dyn Store<Event> + Send + Sync>) =
            match db_type {
                "persistent" => (
                    Box::new(PersistentStore::open(Path::new("tasks.db"), "tasks")?),
                    Box::new(PersistentStore::open(Path::new("event.db"), "events")?),
                ),
                _ => (Box::new(MemoryStore::new()), Box::new(MemoryStore::new())),
            };

        Ok(Manager {
            pending: VecDeque::new(),
            task_db,
            event_db,
            workers,
            worker_task_map,
            task_worker_map: HashMap::new(),
            worker_nodes,
            scheduler,
            client: reqwest::Client::new(),
        })
    }

    /// Accept an event. Never blocks, never fails.
    pub fn add_task(&mut self, event: Event) {
        self.pending.push_back(event);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        match self.task_db.list() {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "listing tasks failed");
                Vec::new()
            }
        }
    }

    pub fn task(&self, id: &Uuid) -> StoreResult<Task> {
        self.task_db.get(&id.to_string())
    }

    pub fn event_count(&self) -> usize {
        self.event_db.count().unwrap_or(0)
    }

    pub fn worker_nodes(&self) -> &[Node] {
        &self.worker_nodes
    }

    pub fn task_worker(&self, id: &Uuid) -> Option<&str> {
        self.task_worker_map.get(id).map(String::as_str)
    }

    pub fn worker_tasks(&self, worker: &str) -> &[Uuid] {
        self.worker_task_map
            .get(worker)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Run the scheduler pipeline for one task.
    pub async fn select_worker(&mut self, task: &Task) -> ManagerResult<Node> {
        let mut candidates = self.scheduler.select_candidate_nodes(task, &self.worker_nodes);
        if candidates.is_empty() {
            return Err(SchedulerError::NoCandidateNodes(task.id).into());
        }

        let scores = self.scheduler.score(task, &mut candidates).await;
        debug!(?scores, "node scores");

        let selected = self
            .scheduler
            .pick(&scores, &candidates)
            .ok_or(SchedulerError::NoCandidateNodes(task.id))?
            .clone();

        // Scoring refreshed the candidates' stats; fold the snapshots back
        // into the node list.
        for candidate in candidates {
            if let Some(node) = self
                .worker_nodes
                .iter_mut()
                .find(|n| n.name == candidate.name)
            {
                *node = candidate;
            }
        }

        Ok(selected)
    }

    /// Drain the pending queue FIFO and dispatch each event: stops are
    /// routed to the mapped worker, new tasks go through the scheduler.
    pub async fn send_work(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            if let Err(e) = self.event_db.put(&event.id.to_string(), event.clone()) {
                error!(event_id = %event.id, error = %e, "persisting event failed");
                return;
            }
            debug!(event_id = %event.id, task_id = %event.task.id, "dequeued task event");

            // The task is already in flight on some worker.
            if let Some(worker) = self.task_worker_map.get(&event.task.id).cloned() {
                let persisted = match self.task_db.get(&event.task.id.to_string()) {
                    Ok(task) => task,
                    Err(e) => {
                        error!(task_id = %event.task.id, error = %e, "cannot schedule task");
                        continue;
                    }
                };

                if event.state == State::Completed
                    && valid_state_transition(persisted.state, event.state)
                {
                    self.stop_task(&worker, &event.task.id.to_string()).await;
                    continue;
                }

                warn!(
                    task_id = %persisted.id,
                    state = %persisted.state,
                    "dropping event: task cannot move to Completed"
                );
                continue;
            }

            let mut task = event.task.clone();
            let node = match self.select_worker(&task).await {
                Ok(node) => node,
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "selecting worker failed");
                    continue;
                }
            };
            info!(worker = %node.name, task_id = %task.id, "task placed");

            self.worker_task_map
                .entry(node.name.clone())
                .or_default()
                .push(task.id);
            self.task_worker_map.insert(task.id, node.name.clone());

            task.state = State::Scheduled;
            if let Err(e) = self.task_db.put(&task.id.to_string(), task.clone()) {
                error!(task_id = %task.id, error = %e, "persisting task failed");
            }

            let url = format!("http://{}/tasks", node.name);
            let resp = match self.client.post(&url).json(&event).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(worker = %node.name, error = %e, "worker unreachable, requeueing event");
                    self.pending.push_back(event);
                    return;
                }
            };

            if resp.status() != StatusCode::CREATED {
                match resp.json::<ErrResponse>().await {
                    Ok(err) => error!(
                        code = err.http_status_code,
                        message = %err.message,
                        "worker rejected task"
                    ),
                    Err(e) => error!(error = %e, "decoding worker error failed"),
                }
                return;
            }

            match resp.json::<Task>().await {
                Ok(created) => {
                    if let Some(node) = self
                        .worker_nodes
                        .iter_mut()
                        .find(|n| n.name == node.name)
                    {
                        node.task_count += 1;
                    }
                    debug!(task_id = %created.id, state = %created.state, "worker accepted task");
                }
                Err(e) => error!(error = %e, "decoding worker response failed"),
            }
        }
    }

    /// One reconciliation pass: pull every worker's task list and overwrite
    /// local records with the worker's truth.
    pub async fn update_tasks(&mut self) {
        for worker in self.workers.clone() {
            debug!(%worker, "fetching task updates");

            let url = format!("http://{worker}/tasks");
            let resp = match self.client.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(%worker, error = %e, "worker unreachable");
                    continue;
                }
            };
            if resp.status() != StatusCode::OK {
                warn!(%worker, status = %resp.status(), "tasks request rejected");
                continue;
            }
            let tasks: Vec<Task> = match resp.json().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(%worker, error = %e, "decoding task list failed");
                    continue;
                }
            };

            self.worker_task_map.insert(worker.clone(), Vec::new());
            for task in tasks {
                let key = task.id.to_string();
                let mut persisted = match self.task_db.get(&key) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "worker reported unknown task");
                        continue;
                    }
                };

                self.worker_task_map
                    .entry(worker.clone())
                    .or_default()
                    .push(task.id);
                self.task_worker_map.insert(task.id, worker.clone());

                persisted.state = task.state;
                persisted.start_time = task.start_time;
                persisted.finish_time = task.finish_time;
                persisted.container_id = task.container_id;
                persisted.host_ports = task.host_ports;

                if let Err(e) = self.task_db.put(&key, persisted) {
                    error!(task_id = %task.id, error = %e, "persisting task update failed");
                }
            }
        }
    }

    /// One health-check pass over every stored task. Running tasks are
    /// probed over HTTP; failed ones restart directly, up to the cap.
    pub async fn do_health_checks(&mut self) {
        for mut task in self.get_tasks() {
            if task.state == State::Running && task.restart_count < MAX_RESTARTS {
                if let Err(e) = self.check_task_health(&task).await {
                    warn!(task_id = %task.id, error = %e, "health check failed");
                    self.restart_task(&mut task).await;
                }
            } else if task.state == State::Failed && task.restart_count < MAX_RESTARTS {
                self.restart_task(&mut task).await;
            }
        }
    }

    async fn check_task_health(&self, task: &Task) -> ManagerResult<()> {
        let worker = self
            .task_worker_map
            .get(&task.id)
            .ok_or(ManagerError::UnmappedTask(task.id))?;
        let host_port = first_host_port(task).ok_or(ManagerError::NoHostPort(task.id))?;
        let worker_host = worker.split(':').next().unwrap_or(worker);

        let url = format!("http://{worker_host}:{host_port}{}", task.healthcheck);
        debug!(task_id = %task.id, %url, "calling task health check");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ManagerError::Transport {
                url: url.clone(),
                source: e,
            })?;

        if resp.status() != StatusCode::OK {
            return Err(ManagerError::Api {
                code: resp.status().as_u16(),
                message: format!("health check failed for task {}", task.id),
            });
        }

        debug!(task_id = %task.id, status = %resp.status(), "task is healthy");
        Ok(())
    }

    async fn restart_task(&mut self, task: &mut Task) {
        let Some(worker) = self.task_worker_map.get(&task.id).cloned() else {
            warn!(task_id = %task.id, "no worker mapped, cannot restart");
            return;
        };

        task.state = State::Scheduled;
        task.restart_count += 1;
        if let Err(e) = self.task_db.put(&task.id.to_string(), task.clone()) {
            error!(task_id = %task.id, error = %e, "persisting restart failed");
        }
        info!(task_id = %task.id, restart_count = task.restart_count, "restarting task");

        let event = Event::new(State::Running, task.clone());
        let url = format!("http://{worker}/tasks");
        let resp = match self.client.post(&url).json(&event).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(%worker, error = %e, "worker unreachable, requeueing restart");
                self.pending.push_back(event);
                return;
            }
        };

        if resp.status() != StatusCode::CREATED {
            match resp.json::<ErrResponse>().await {
                Ok(err) => error!(
                    code = err.http_status_code,
                    message = %err.message,
                    "worker rejected restart"
                ),
                Err(e) => error!(error = %e, "decoding worker error failed"),
            }
            return;
        }

        match resp.json::<Task>().await {
            Ok(task) => debug!(task_id = %task.id, state = %task.state, "task restarted"),
            Err(e) => error!(error = %e, "decoding worker response failed"),
        }
    }

    /// Command a stop directly on the worker that runs the task.
    async fn stop_task(&self, worker: &str, task_id: &str) {
        let url = format!("http://{worker}/tasks/{task_id}");
        match self.client.delete(&url).send().await {
            Ok(resp) if resp.status() == StatusCode::NO_CONTENT => {
                info!(%task_id, %worker, "stop request sent");
            }
            Ok(resp) => warn!(%task_id, status = %resp.status(), "stop request rejected"),
            Err(e) => warn!(%task_id, error = %e, "stop request failed"),
        }
    }
}

fn first_host_port(task: &Task) -> Option<String> {
    task.host_ports
        .as_ref()?
        .values()
        .flatten()
        .flatten()
        .find_map(|binding| binding.host_port.clone())
}

/// Drain and dispatch pending events every ten seconds.
pub async fn process_tasks(manager: Arc<Mutex<Manager>>) {
    loop {
        debug!("processing pending task events");
        manager.lock().await.send_work().await;
        sleep(Duration::from_secs(10)).await;
    }
}

/// Reconcile against every worker every fifteen seconds.
pub async fn update_tasks(manager: Arc<Mutex<Manager>>) {
    loop {
        debug!("checking workers for task updates");
        manager.lock().await.update_tasks().await;
        sleep(Duration::from_secs(15)).await;
    }
}

/// Probe task health every sixty seconds.
pub async fn do_health_checks(manager: Arc<Mutex<Manager>>) {
    loop {
        debug!("running task health checks");
        manager.lock().await.do_health_checks().await;
        sleep(Duration::from_secs(60)).await;
    }
}
