//! Task model: the lifecycle state machine, the task entity itself, the
//! events that request state transitions, and the container configuration
//! derived from a task.

pub mod docker;
pub mod state;

use std::collections::HashMap;
use std::fmt;

use bollard::secret::PortBinding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Container port map as published by the runtime after start:
/// `"80/tcp" -> [{host_ip, host_port}, ...]`.
pub type PortMap = HashMap<String, Option<Vec<PortBinding>>>;

/// Lifecycle state of a task. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Pending => "Pending",
            State::Scheduled => "Scheduled",
            State::Running => "Running",
            State::Completed => "Completed",
            State::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// A declared unit of containerized work.
///
/// The manager owns the desired side of a task (image, resources, restart
/// policy); the worker owns the runtime facts (`container_id`, `host_ports`,
/// the observed state) and reports them back during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Task {
    pub id: Uuid,
    pub container_id: Option<String>,
    pub name: String,
    pub state: State,
    pub image: String,
    pub cpu: f64,
    /// Requested memory in bytes.
    pub memory: i64,
    /// Requested disk in bytes.
    pub disk: i64,
    pub exposed_ports: Vec<u16>,
    pub port_bindings: HashMap<String, String>,
    /// Host port bindings observed after the container started.
    pub host_ports: Option<PortMap>,
    pub restart_policy: String,
    /// Health-check URL path, e.g. `/health`.
    pub healthcheck: String,
    pub restart_count: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl Default for Task {
    fn default() -> Self {
        Task {
            id: Uuid::new_v4(),
            container_id: None,
            name: String::new(),
            state: State::Pending,
            image: String::new(),
            cpu: 0.0,
            memory: 0,
            disk: 0,
            exposed_ports: Vec::new(),
            port_bindings: HashMap::new(),
            host_ports: None,
            restart_policy: String::new(),
            healthcheck: String::new(),
            restart_count: 0,
            start_time: None,
            finish_time: None,
        }
    }
}

/// A request to move a task into a new state, carrying a snapshot of the
/// task at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Event {
    pub id: Uuid,
    pub state: State,
    pub timestamp: Option<DateTime<Utc>>,
    pub task: Task,
}

impl Default for Event {
    fn default() -> Self {
        Event {
            id: Uuid::new_v4(),
            state: State::Pending,
            timestamp: None,
            task: Task::default(),
        }
    }
}

impl Event {
    pub fn new(state: State, task: Task) -> Self {
        Event {
            id: Uuid::new_v4(),
            state,
            timestamp: Some(Utc::now()),
            task,
        }
    }
}

/// Container configuration handed to the runtime driver.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub name: String,
    pub exposed_ports: Vec<u16>,
    pub cmd: Vec<String>,
    pub image: String,
    pub cpu: f64,
    pub memory: i64,
    pub disk: i64,
    pub env: Vec<String>,
    pub restart_policy: String,
}

impl Config {
    pub fn from_task(task: &Task) -> Self {
        Config {
            name: task.name.clone(),
            exposed_ports: task.exposed_ports.clone(),
            image: task.image.clone(),
            cpu: task.cpu,
            memory: task.memory,
            disk: task.disk,
            restart_policy: task.restart_policy.clone(),
            ..Default::default()
        }
    }
}
