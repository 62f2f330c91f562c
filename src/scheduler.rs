//! Task placement: candidate filtering, scoring and the final pick.
//!
//! Two strategies sit behind one trait. Round-robin rotates a cursor over
//! the worker list; E-PVM estimates the marginal cost of adding the task to
//! each node from its cpu and memory pressure and picks the cheapest.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::warn;
use uuid::Uuid;

use crate::node::{Node, NodeResult};
use crate::task::Task;
use crate::worker::stats::Stats;

/// Lieb's square-ice constant, the base of the E-PVM cost exponentials.
pub const LIEB: f64 = 1.539_600_717_839_002_038_69;

const MAX_JOBS: f64 = 4.0;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no candidate node for task {0}")]
    NoCandidateNodes(Uuid),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// The placement pipeline. The three steps are always called in order:
/// filter by hard constraints, assign each candidate a cost (lower is
/// better), pick the cheapest.
#[async_trait]
pub trait Scheduler: Send {
    fn select_candidate_nodes(&self, task: &Task, nodes: &[Node]) -> Vec<Node>;

    /// Scoring may refresh per-node stats and mutate strategy state (the
    /// round-robin cursor advances here).
    async fn score(&mut self, task: &Task, nodes: &mut [Node]) -> HashMap<String, f64>;

    /// Minimum-cost candidate; ties go to the first-encountered node.
    fn pick<'a>(&self, scores: &HashMap<String, f64>, candidates: &'a [Node]) -> Option<&'a Node>;
}

/// Rotate through all workers regardless of load.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last_worker: usize,
}

#[async_trait]
impl Scheduler for RoundRobin {
    fn select_candidate_nodes(&self, _task: &Task, nodes: &[Node]) -> Vec<Node> {
        nodes.to_vec()
    }

    async fn score(&mut self, _task: &Task, nodes: &mut [Node]) -> HashMap<String, f64> {
        let mut node_scores = HashMap::new();
        if nodes.is_empty() {
            return node_scores;
        }

        // The cursor starts at 0, so the first pick lands on index 1 and
        // wraps through 0 afterwards.
        let new_worker = (self.last_worker + 1) % nodes.len();
        self.last_worker = new_worker;

        for (idx, node) in nodes.iter().enumerate() {
            let cost = if idx == new_worker { 0.1 } else { 1.0 };
            node_scores.insert(node.name.clone(), cost);
        }
        node_scores
    }

    fn pick<'a>(&self, scores: &HashMap<String, f64>, candidates: &'a [Node]) -> Option<&'a Node> {
        min_cost_node(scores, candidates)
    }
}

/// Cost-based placement over cpu and memory pressure.
#[derive(Debug, Default)]
pub struct EPvm;

#[async_trait]
impl Scheduler for EPvm {
    /// Keep only nodes with enough free disk for the task.
    fn select_candidate_nodes(&self, task: &Task, nodes: &[Node]) -> Vec<Node> {
        nodes
            .iter()
            .filter(|node| task.disk <= node.disk - node.disk_allocated)
            .cloned()
            .collect()
    }

    async fn score(&mut self, task: &Task, nodes: &mut [Node]) -> HashMap<String, f64> {
        let mut node_scores = HashMap::new();

        for node in nodes.iter_mut() {
            let cpu_usage = match calculate_cpu_usage(node).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(node = %node.name, error = %e, "cpu usage sampling failed");
                    continue;
                }
            };

            let task_count = node.task_count as f64;
            let cpu_load = calculate_load(cpu_usage, 2f64.powf(0.8));
            let cpu_cost = LIEB.powf(cpu_load) + LIEB.powf((task_count + 1.0) / MAX_JOBS)
                - LIEB.powf(cpu_load)
                - LIEB.powf(task_count / MAX_JOBS);

            let memory_allocated = node.stats.mem_used_kb() as f64 + node.memory_allocated as f64;
            let memory_percent_allocated = memory_allocated / node.memory as f64;
            let new_mem_percent = calculate_load(
                memory_allocated + (task.memory / 1000) as f64,
                node.memory as f64,
            );
            let mem_cost = LIEB.powf(new_mem_percent) + LIEB.powf((task_count + 1.0) / MAX_JOBS)
                - LIEB.powf(memory_percent_allocated)
                - LIEB.powf(task_count / MAX_JOBS);

            node_scores.insert(node.name.clone(), cpu_cost + mem_cost);
        }

        node_scores
    }

    fn pick<'a>(&self, scores: &HashMap<String, f64>, candidates: &'a [Node]) -> Option<&'a Node> {
        min_cost_node(scores, candidates)
    }
}

/// Candidates without a score entry are skipped.
fn min_cost_node<'a>(scores: &HashMap<String, f64>, candidates: &'a [Node]) -> Option<&'a Node> {
    let mut best: Option<(&Node, f64)> = None;
    for node in candidates {
        let Some(&score) = scores.get(&node.name) else {
            continue;
        };
        match best {
            Some((_, lowest)) if score >= lowest => {}
            _ => best = Some((node, score)),
        }
    }
    best.map(|(node, _)| node)
}

/// Sample the node's cpu counters twice, three seconds apart, and compute
/// the busy share of the elapsed jiffies.
async fn calculate_cpu_usage(node: &mut Node) -> NodeResult<f64> {
    let stat1 = node.get_stats().await?;
    sleep(Duration::from_secs(3)).await;
    let stat2 = node.get_stats().await?;
    Ok(cpu_usage_between(&stat1, &stat2))
}

fn cpu_usage_between(stat1: &Stats, stat2: &Stats) -> f64 {
    let idle1 = (stat1.cpu_stats.idle + stat1.cpu_stats.io_wait) as i64;
    let idle2 = (stat2.cpu_stats.idle + stat2.cpu_stats.io_wait) as i64;

    let non_idle1 = (stat1.cpu_stats.user
        + stat1.cpu_stats.nice
        + stat1.cpu_stats.system
        + stat1.cpu_stats.irq
        + stat1.cpu_stats.soft_irq
        + stat1.cpu_stats.steal) as i64;
    let non_idle2 = (stat2.cpu_stats.user
        + stat2.cpu_stats.nice
        + stat2.cpu_stats.system
        + stat2.cpu_stats.irq
        + stat2.cpu_stats.soft_irq
        + stat2.cpu_stats.steal) as i64;

    let total1 = idle1 + non_idle1;
    let total2 = idle2 + non_idle2;

    let total = total2 - total1;
    let idle = idle2 - idle1;

    if total == 0 && idle == 0 {
        0.0
    } else {
        (total as f64 - idle as f64) / total as f64
    }
}

fn calculate_load(usage: f64, capacity: f64) -> f64 {
    usage / capacity
}
