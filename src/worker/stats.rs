//! Host statistics: memory and cpu counters from procfs, disk capacity
//! from the mounted filesystems.

use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tracing::warn;

/// Cumulative cpu jiffies from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub io_wait: u64,
    pub irq: u64,
    pub soft_irq: u64,
    pub steal: u64,
}

/// Memory figures in KiB, as `/proc/meminfo` reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
    pub used_kb: u64,
}

/// Disk figures in bytes, summed over mounted disks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Snapshot of a worker host, served on `GET /stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub mem_stats: MemInfo,
    pub disk_stats: DiskInfo,
    pub cpu_stats: CpuStats,
    pub task_count: i64,
}

impl Stats {
    pub fn mem_total_kb(&self) -> u64 {
        self.mem_stats.total_kb
    }

    pub fn mem_used_kb(&self) -> u64 {
        self.mem_stats.used_kb
    }

    pub fn mem_available_kb(&self) -> u64 {
        self.mem_stats.available_kb
    }

    pub fn disk_total(&self) -> u64 {
        self.disk_stats.total
    }
}

/// Sample the host. Unreadable procfs entries degrade to zeroed sections
/// rather than failing the collection pass.
pub fn get_stats() -> Stats {
    let mem_stats = match std::fs::read_to_string("/proc/meminfo") {
        Ok(content) => parse_meminfo(&content),
        Err(e) => {
            warn!(error = %e, "cannot read /proc/meminfo");
            MemInfo::default()
        }
    };

    let cpu_stats = match std::fs::read_to_string("/proc/stat") {
        Ok(content) => parse_proc_stat(&content),
        Err(e) => {
            warn!(error = %e, "cannot read /proc/stat");
            CpuStats::default()
        }
    };

    Stats {
        mem_stats,
        disk_stats: read_disks(),
        cpu_stats,
        task_count: 0,
    }
}

fn parse_meminfo(content: &str) -> MemInfo {
    let mut info = MemInfo::default();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(label), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let value: u64 = value.parse().unwrap_or(0);
        match label {
            "MemTotal:" => info.total_kb = value,
            "MemAvailable:" => info.available_kb = value,
            _ => {}
        }
    }
    info.used_kb = info.total_kb.saturating_sub(info.available_kb);
    info
}

fn parse_proc_stat(content: &str) -> CpuStats {
    let Some(cpu_line) = content.lines().next() else {
        return CpuStats::default();
    };
    let fields: Vec<u64> = cpu_line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse().unwrap_or(0))
        .collect();
    if fields.len() < 8 {
        return CpuStats::default();
    }
    CpuStats {
        user: fields[0],
        nice: fields[1],
        system: fields[2],
        idle: fields[3],
        io_wait: fields[4],
        irq: fields[5],
        soft_irq: fields[6],
        steal: fields[7],
    }
}

fn read_disks() -> DiskInfo {
    let disks = Disks::new_with_refreshed_list();
    let total: u64 = disks.iter().map(|d| d.total_space()).sum();
    let free: u64 = disks.iter().map(|d| d.available_space()).sum();
    DiskInfo {
        total,
        used: total.saturating_sub(free),
        free,
    }
}
