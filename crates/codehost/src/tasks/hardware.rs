//! Host hardware snapshot read from procfs.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

#[derive(Debug, Clone, Serialize)]
pub struct HardwareInfo {
    pub cpu_count: usize,
    pub cpu_model: String,
    pub domain: Option<String>,
    pub total_memory: u64,
    pub free_memory: u64,
    pub uptime_seconds: f64,
}

/// Read the current host state. Nothing is cached.
pub async fn read_hardware_info(domain: Option<String>) -> Result<HardwareInfo> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo")
        .await
        .context("reading /proc/cpuinfo")?;
    let meminfo = fs::read_to_string("/proc/meminfo")
        .await
        .context("reading /proc/meminfo")?;
    let uptime_seconds = read_uptime().await?;

    let (mut cpu_count, cpu_model) = parse_cpuinfo(&cpuinfo);
    if cpu_count == 0 {
        cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
    }
    let (total_memory, free_memory) = parse_meminfo(&meminfo)?;

    Ok(HardwareInfo {
        cpu_count,
        cpu_model,
        domain,
        total_memory,
        free_memory,
        uptime_seconds,
    })
}

/// Seconds since boot, from `/proc/uptime`.
pub(crate) async fn read_uptime() -> Result<f64> {
    let contents = fs::read_to_string("/proc/uptime")
        .await
        .context("reading /proc/uptime")?;
    parse_uptime(&contents)
}

fn parse_uptime(contents: &str) -> Result<f64> {
    contents
        .split_whitespace()
        .next()
        .context("empty /proc/uptime")?
        .parse::<f64>()
        .context("parsing /proc/uptime")
}

/// Processor count and the first model name.
fn parse_cpuinfo(contents: &str) -> (usize, String) {
    let mut count = 0;
    let mut model = None;

    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => count += 1,
            "model name" | "Hardware" | "cpu model" if model.is_none() => {
                model = Some(value.trim().to_string());
            }
            _ => {}
        }
    }

    (count, model.unwrap_or_else(|| "unknown".to_string()))
}

/// Total and available memory in bytes.
fn parse_meminfo(contents: &str) -> Result<(u64, u64)> {
    let mut total_kb = None;
    let mut available_kb = None;
    let mut free_kb = None;

    for line in contents.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = parse_meminfo_kb(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = parse_meminfo_kb(line);
        } else if line.starts_with("MemFree:") {
            free_kb = parse_meminfo_kb(line);
        }
    }

    let total_kb = total_kb.context("missing MemTotal in /proc/meminfo")?;
    let free_kb = available_kb
        .or(free_kb)
        .context("missing MemAvailable in /proc/meminfo")?;

    Ok((total_kb.saturating_mul(1024), free_kb.saturating_mul(1024)))
}

pub(crate) fn parse_meminfo_kb(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}
