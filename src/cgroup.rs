//! cgroup support for container-aware resource management
//!
//! Detects CPU and memory limits within containerized environments by reading
//! cgroup information, and samples memory usage for the flush checker's
//! watermark policy.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

static AVAILABLE_CPUS: OnceLock<usize> = OnceLock::new();

/// Memory usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStat {
    pub total: u64,
    pub used: u64,
}

impl MemoryStat {
    /// Used memory as a ratio in `[0, 1]`.
    pub fn used_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.used as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

/// Returns the number of available CPU cores for the application.
/// This takes into account cgroup CPU quotas if running in a container.
pub fn available_cpus() -> usize {
    *AVAILABLE_CPUS.get_or_init(detect_cpu_quota)
}

fn detect_cpu_quota() -> usize {
    if let Some(n) = parse_cpu_override_env("LINDB_MAX_CPUS") {
        return n;
    }

    if let Some(quota) = get_cpu_quota() {
        let num_cpus = num_cpus::get();
        // Fractional quotas below 1 CPU still get one worker.
        let calculated = quota.ceil() as usize;

        if calculated > 0 && calculated < num_cpus {
            return calculated;
        }
    }

    num_cpus::get()
}

fn parse_cpu_override_env(var_name: &str) -> Option<usize> {
    let value = std::env::var(var_name).ok()?;
    let parsed = value.parse::<usize>().ok()?;
    (parsed > 0).then_some(parsed)
}

fn get_cpu_quota() -> Option<f64> {
    get_cpu_quota_v2().or_else(get_cpu_quota_v1)
}

fn get_cpu_quota_v2() -> Option<f64> {
    let content = fs::read_to_string("/sys/fs/cgroup/cpu.max").ok()?;
    let parts: Vec<&str> = content.split_whitespace().collect();

    if parts.len() != 2 || parts[0] == "max" {
        return None;
    }

    let quota = parts[0].parse::<f64>().ok()?;
    let period = parts[1].parse::<f64>().ok()?;
    if period <= 0.0 {
        return None;
    }

    Some(quota / period)
}

fn get_cpu_quota_v1() -> Option<f64> {
    let quota = read_cgroup_value("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")?;
    if quota <= 0 {
        return None;
    }

    let period = read_cgroup_value("/sys/fs/cgroup/cpu/cpu.cfs_period_us")?;
    if period <= 0 {
        return None;
    }
    Some(quota as f64 / period as f64)
}

fn read_cgroup_value(path: &str) -> Option<i64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Memory limit in bytes from cgroup settings.
fn get_memory_limit() -> Option<i64> {
    get_memory_limit_v2().or_else(get_memory_limit_v1)
}

fn get_memory_limit_v2() -> Option<i64> {
    let mem_max_path = "/sys/fs/cgroup/memory.max";
    if !Path::new(mem_max_path).exists() {
        return None;
    }

    let content = fs::read_to_string(mem_max_path).ok()?;
    let trimmed = content.trim();

    if trimmed == "max" {
        return None;
    }

    trimmed.parse().ok()
}

fn get_memory_limit_v1() -> Option<i64> {
    // An unlimited v1 cgroup reports a huge page-aligned number.
    read_cgroup_value("/sys/fs/cgroup/memory/memory.limit_in_bytes")
        .filter(|limit| *limit > 0 && *limit < i64::MAX / 2)
}

fn get_memory_usage() -> Option<i64> {
    read_cgroup_value("/sys/fs/cgroup/memory.current")
        .or_else(|| read_cgroup_value("/sys/fs/cgroup/memory/memory.usage_in_bytes"))
}

/// Samples current memory usage, preferring the container's cgroup limit and
/// falling back to host-wide `/proc/meminfo`.
pub fn memory_stat() -> Option<MemoryStat> {
    if let (Some(limit), Some(usage)) = (get_memory_limit(), get_memory_usage())
        && limit > 0
    {
        return Some(MemoryStat {
            total: limit as u64,
            used: usage.max(0) as u64,
        });
    }

    let content = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&content)
}

/// Parses `/proc/meminfo` content; values are reported in kB.
fn parse_meminfo(content: &str) -> Option<MemoryStat> {
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let value = parts.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            Some("MemTotal:") => total = value,
            Some("MemAvailable:") => available = value,
            _ => {}
        }
    }

    let total = total? * 1024;
    let available = available? * 1024;
    Some(MemoryStat {
        total,
        used: total.saturating_sub(available),
    })
}

/// Returns the used memory ratio, `0.0` when it cannot be sampled.
pub fn memory_used_ratio() -> f64 {
    memory_stat().map(|s| s.used_ratio()).unwrap_or(0.0)
}

/// Returns the default number of workers based on available CPUs
pub fn default_workers_limit() -> usize {
    available_cpus()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_cpus() {
        let cpus = available_cpus();
        assert!(cpus > 0);
        assert!(cpus <= 1024);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let stat = parse_meminfo(content).unwrap();
        assert_eq!(stat.total, 16_000_000 * 1024);
        assert_eq!(stat.used, 12_000_000 * 1024);
        assert!((stat.used_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_meminfo_missing_fields() {
        assert!(parse_meminfo("MemTotal: 100 kB\n").is_none());
        assert!(parse_meminfo("").is_none());
    }

    #[test]
    fn test_used_ratio_of_empty_total() {
        let stat = MemoryStat { total: 0, used: 10 };
        assert_eq!(stat.used_ratio(), 0.0);
    }
}
