// =============================================================================
// /proc Collector — the in-process system metrics producer
// =============================================================================
//
// Reads a small set of /proc files every update period and drives the
// chart API directly: system.cpu (per-mode share of the total delta),
// system.ram (absolute, MiB) and system.load (absolute, scaled by 1000).
//
// `MERIDIAN_HOST_PREFIX` is prepended to every /proc path, so the
// collector works from inside a container observing the host.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::rrd::registry::{ChartRegistry, ChartSpec};
use crate::rrd::Chart;
use crate::types::{Algorithm, ChartType};

pub const HOST_PREFIX_ENV: &str = "MERIDIAN_HOST_PREFIX";

fn proc_path(file: &str) -> String {
    match std::env::var(HOST_PREFIX_ENV) {
        Ok(prefix) if !prefix.is_empty() => format!("{prefix}{file}"),
        _ => file.to_string(),
    }
}

// =============================================================================
// Parsers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    pub user: i64,
    pub nice: i64,
    pub system: i64,
    pub idle: i64,
    pub iowait: i64,
    pub irq: i64,
    pub softirq: i64,
}

/// Parse the aggregate `cpu` line of /proc/stat.
pub fn parse_cpu(stat: &str) -> Option<CpuSample> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu ") || l.starts_with("cpu\t"))?;
    let mut it = line.split_whitespace().skip(1);
    let mut next = || it.next().and_then(|v| v.parse::<i64>().ok());
    Some(CpuSample {
        user: next()?,
        nice: next()?,
        system: next()?,
        idle: next()?,
        iowait: next().unwrap_or(0),
        irq: next().unwrap_or(0),
        softirq: next().unwrap_or(0),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSample {
    /// All values in KiB, straight from /proc/meminfo.
    pub total: i64,
    pub free: i64,
    pub buffers: i64,
    pub cached: i64,
}

impl MemSample {
    pub fn used(&self) -> i64 {
        (self.total - self.free - self.buffers - self.cached).max(0)
    }
}

pub fn parse_meminfo(meminfo: &str) -> Option<MemSample> {
    let field = |name: &str| -> Option<i64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    Some(MemSample {
        total: field("MemTotal:")?,
        free: field("MemFree:")?,
        buffers: field("Buffers:").unwrap_or(0),
        cached: field("Cached:").unwrap_or(0),
    })
}

/// Parse /proc/loadavg into the three load averages scaled by 1000.
pub fn parse_loadavg(loadavg: &str) -> Option<(i64, i64, i64)> {
    let mut it = loadavg.split_whitespace();
    let mut next = || -> Option<i64> {
        it.next()?
            .parse::<f64>()
            .ok()
            .map(|v| (v * 1000.0).round() as i64)
    };
    Some((next()?, next()?, next()?))
}

// =============================================================================
// Collector
// =============================================================================

struct ProcCharts {
    cpu: Arc<Chart>,
    ram: Arc<Chart>,
    load: Arc<Chart>,
}

fn create_charts(registry: &ChartRegistry, update_every: u32) -> ProcCharts {
    let cpu = registry.create_or_get(ChartSpec {
        type_name: "system".into(),
        id: "cpu".into(),
        title: Some("Total CPU Utilization".into()),
        units: Some("percentage".into()),
        family: Some("cpu".into()),
        priority: 100,
        update_every,
        chart_type: ChartType::Stacked,
        ..Default::default()
    });
    for mode in ["user", "nice", "system", "iowait", "irq", "softirq"] {
        cpu.find_or_add_dimension(mode, mode, Algorithm::PctOfDiffRow, 1, 1, false);
    }
    // idle participates in the row total but is noise on a dashboard
    cpu.find_or_add_dimension("idle", "idle", Algorithm::PctOfDiffRow, 1, 1, true);

    let ram = registry.create_or_get(ChartSpec {
        type_name: "system".into(),
        id: "ram".into(),
        title: Some("System RAM".into()),
        units: Some("MiB".into()),
        family: Some("ram".into()),
        priority: 200,
        update_every,
        chart_type: ChartType::Stacked,
        ..Default::default()
    });
    for dim in ["used", "free", "buffers", "cached"] {
        ram.find_or_add_dimension(dim, dim, Algorithm::Absolute, 1, 1024, false);
    }

    let load = registry.create_or_get(ChartSpec {
        type_name: "system".into(),
        id: "load".into(),
        title: Some("System Load Average".into()),
        units: Some("load".into()),
        family: Some("load".into()),
        priority: 300,
        update_every,
        chart_type: ChartType::Line,
        ..Default::default()
    });
    for dim in ["load1", "load5", "load15"] {
        load.find_or_add_dimension(dim, dim, Algorithm::Absolute, 1, 1000, false);
    }

    ProcCharts { cpu, ram, load }
}

fn collect_once(charts: &ProcCharts) -> Result<()> {
    let stat = std::fs::read_to_string(proc_path("/proc/stat"))
        .context("reading /proc/stat")?;
    if let Some(cpu) = parse_cpu(&stat) {
        charts.cpu.next();
        charts.cpu.set("user", cpu.user);
        charts.cpu.set("nice", cpu.nice);
        charts.cpu.set("system", cpu.system);
        charts.cpu.set("iowait", cpu.iowait);
        charts.cpu.set("irq", cpu.irq);
        charts.cpu.set("softirq", cpu.softirq);
        charts.cpu.set("idle", cpu.idle);
        charts.cpu.done();
    }

    let meminfo = std::fs::read_to_string(proc_path("/proc/meminfo"))
        .context("reading /proc/meminfo")?;
    if let Some(mem) = parse_meminfo(&meminfo) {
        charts.ram.next();
        charts.ram.set("used", mem.used());
        charts.ram.set("free", mem.free);
        charts.ram.set("buffers", mem.buffers);
        charts.ram.set("cached", mem.cached);
        charts.ram.done();
    }

    let loadavg = std::fs::read_to_string(proc_path("/proc/loadavg"))
        .context("reading /proc/loadavg")?;
    if let Some((l1, l5, l15)) = parse_loadavg(&loadavg) {
        charts.load.next();
        charts.load.set("load1", l1);
        charts.load.set("load5", l5);
        charts.load.set("load15", l15);
        charts.load.done();
    }

    Ok(())
}

/// Collect /proc metrics forever on the configured cadence.
pub async fn run_collector(registry: Arc<ChartRegistry>) {
    let update_every = registry.config().update_every;
    let charts = create_charts(&registry, update_every);
    info!(update_every, "proc collector started");

    let mut interval = tokio::time::interval(Duration::from_secs(update_every as u64));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = collect_once(&charts) {
            warn!(error = %e, "proc collection failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
