//! Per-process CPU and memory sampling from procfs.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

use super::hardware::{parse_meminfo_kb, read_uptime};

const FALLBACK_CLOCK_TICKS: u64 = 100;

/// Resource consumption of one process.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub pid: u32,
    pub ppid: u32,
    /// Average CPU usage over the lifetime of the process, in percent of one core.
    pub cpu_percent: f64,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    /// User + system CPU time in milliseconds.
    pub cpu_time_ms: u64,
    /// Wall time since the process started, in milliseconds.
    pub elapsed_ms: u64,
    /// When the sample was taken, in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcStat {
    ppid: u32,
    utime: u64,
    stime: u64,
    start_time: u64,
}

/// Sample `pid` right now.
pub async fn sample(pid: u32) -> Result<ResourceUsage> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .with_context(|| format!("reading /proc/{pid}/stat"))?;
    let status = fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .with_context(|| format!("reading /proc/{pid}/status"))?;
    let uptime = read_uptime().await?;

    let stat = parse_proc_stat(&stat)?;
    let ticks = clock_ticks();

    let cpu_secs = (stat.utime + stat.stime) as f64 / ticks as f64;
    let elapsed_secs = (uptime - stat.start_time as f64 / ticks as f64).max(0.0);
    let cpu_percent = if elapsed_secs > 0.0 {
        cpu_secs / elapsed_secs * 100.0
    } else {
        0.0
    };

    Ok(ResourceUsage {
        pid,
        ppid: stat.ppid,
        cpu_percent,
        memory_bytes: parse_rss_bytes(&status),
        cpu_time_ms: (cpu_secs * 1000.0) as u64,
        elapsed_ms: (elapsed_secs * 1000.0) as u64,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
    })
}

fn clock_ticks() -> u64 {
    // SAFETY: sysconf only reads a system constant.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        FALLBACK_CLOCK_TICKS
    }
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_proc_stat(contents: &str) -> Result<ProcStat> {
    let (_, rest) = contents
        .rsplit_once(')')
        .context("malformed /proc stat line")?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // fields[0] is field 3 (state) in proc(5) numbering.
    let field = |n: usize| -> Result<u64> {
        fields
            .get(n - 3)
            .with_context(|| format!("missing stat field {n}"))?
            .parse::<u64>()
            .with_context(|| format!("parsing stat field {n}"))
    };

    Ok(ProcStat {
        ppid: field(4)? as u32,
        utime: field(14)?,
        stime: field(15)?,
        start_time: field(22)?,
    })
}

/// Resident memory from `/proc/<pid>/status`. Zombies have no `VmRSS`.
fn parse_rss_bytes(status: &str) -> u64 {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(parse_meminfo_kb)
        .unwrap_or(0)
        .saturating_mul(1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_stat() {
        let sample = "4242 (node) S 4200 4242 4200 0 -1 4194304 1234 0 0 0 250 50 0 0 20 0 11 0 987654 1000000 5000 18446744073709551615 1 1 0 0 0 0 0 16781312 17922 0 0 0 17 3 0 0 0 0 0";
        let stat = parse_proc_stat(sample).unwrap();
        assert_eq!(
            stat,
            ProcStat {
                ppid: 4200,
                utime: 250,
                stime: 50,
                start_time: 987654,
            }
        );
    }

    #[test]
    fn test_parse_proc_stat_with_odd_command_name() {
        let sample = "7 (my (weird) proc) R 1 7 7 0 -1 0 0 0 0 0 10 20 0 0 20 0 1 0 500 0 0";
        let stat = parse_proc_stat(sample).unwrap();
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.utime, 10);
        assert_eq!(stat.stime, 20);
        assert_eq!(stat.start_time, 500);
    }

    #[test]
    fn test_parse_proc_stat_rejects_truncated() {
        assert!(parse_proc_stat("1 (init) S 0 1").is_err());
        assert!(parse_proc_stat("garbage").is_err());
    }

    #[test]
    fn test_parse_rss_bytes() {
        let status = "Name:\tnode\nVmPeak:\t  20000 kB\nVmRSS:\t   5120 kB\n";
        assert_eq!(parse_rss_bytes(status), 5120 * 1024);
        assert_eq!(parse_rss_bytes("Name:\tzombie\n"), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sample_own_process() {
        let pid = std::process::id();
        let usage = sample(pid).await.unwrap();
        assert_eq!(usage.pid, pid);
        assert!(usage.memory_bytes > 0);
        assert!(usage.cpu_percent >= 0.0);
    }
}
