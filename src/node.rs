//! The manager's view of a worker node: capacity, allocations and the most
//! recent stats snapshot.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::utils::with_retry;
use crate::worker::stats::Stats;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("cannot connect to {api}: {message}")]
    Connect { api: String, message: String },

    #[error("stats request to {api} answered {status}")]
    Status { api: String, status: u16 },

    #[error("cannot decode stats from {name}: {message}")]
    Decode { name: String, message: String },
}

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Worker address as `host:port`; doubles as its identity.
    pub name: String,
    pub ip: String,
    /// Base URL of the worker API.
    pub api: String,
    pub cores: i64,
    /// Total memory in KiB, refreshed from the worker's stats.
    pub memory: i64,
    pub memory_allocated: i64,
    /// Total disk in bytes, refreshed from the worker's stats.
    pub disk: i64,
    pub disk_allocated: i64,
    pub stats: Stats,
    pub role: String,
    pub task_count: i64,
}

impl Node {
    pub fn new(name: &str, api: &str, role: &str) -> Self {
        Node {
            name: name.to_string(),
            ip: String::new(),
            api: api.to_string(),
            cores: 0,
            memory: 0,
            memory_allocated: 0,
            disk: 0,
            disk_allocated: 0,
            stats: Stats::default(),
            role: role.to_string(),
            task_count: 0,
        }
    }

    /// Fetch `/stats` from the worker, cache the snapshot and refresh the
    /// node's capacity figures from it. Prior state is kept on failure.
    pub async fn get_stats(&mut self) -> NodeResult<Stats> {
        let url = format!("{}/stats", self.api);
        let client = reqwest::Client::new();

        let resp = with_retry(|| client.get(&url).send())
            .await
            .map_err(|e| {
                warn!(api = %self.api, error = %e, "worker unreachable");
                NodeError::Connect {
                    api: self.api.clone(),
                    message: e.to_string(),
                }
            })?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(NodeError::Status {
                api: self.api.clone(),
                status: resp.status().as_u16(),
            });
        }

        let stats: Stats = resp.json().await.map_err(|e| NodeError::Decode {
            name: self.name.clone(),
            message: e.to_string(),
        })?;

        self.memory = stats.mem_total_kb() as i64;
        self.disk = stats.disk_total() as i64;
        self.stats = stats.clone();

        Ok(stats)
    }
}
