//! Point-in-time host metrics.
//!
//! Memory and disk totals are computed once at construction and cached; used
//! values are sampled fresh on every call. CPU sampling never inserts a
//! delay: usage is the delta since the previous refresh, so the very first
//! reading after startup can be zero.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::sync::Mutex;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

/// Filesystems that do not map to a physical partition.
const EXCLUDED_FILESYSTEMS: [&str; 9] = [
    "tmpfs", "devtmpfs", "overlay", "squashfs", "autofs", "proc", "sysfs", "cgroup", "devpts",
];

pub struct MetricsSampler {
    system: Mutex<System>,
    memory_total: u64,
    disk_total: u64,
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        system.refresh_memory();
        system.refresh_cpu_usage();
        let memory_total = system.total_memory();
        let disk_total = physical_disks()
            .iter()
            .map(|(_, total, _)| total)
            .sum::<u64>();

        Self {
            system: Mutex::new(system),
            memory_total,
            disk_total,
        }
    }

    /// Aggregate CPU usage in percent since the previous call.
    pub fn cpu_usage_percent(&self) -> f64 {
        let mut system = self.system.lock().expect("metrics lock poisoned");
        system.refresh_cpu_usage();
        system.global_cpu_info().cpu_usage() as f64
    }

    pub fn memory_used_bytes(&self) -> u64 {
        let mut system = self.system.lock().expect("metrics lock poisoned");
        system.refresh_memory();
        system.used_memory()
    }

    pub fn memory_total_bytes(&self) -> u64 {
        self.memory_total
    }

    pub fn disk_used_bytes(&self) -> u64 {
        physical_disks()
            .iter()
            .map(|(_, total, available)| total.saturating_sub(*available))
            .sum()
    }

    pub fn disk_total_bytes(&self) -> u64 {
        self.disk_total
    }

    pub fn uptime_seconds(&self) -> u64 {
        System::uptime()
    }
}

/// Lists `(device, total, available)` for physical partitions only,
/// deduplicated by device name.
fn physical_disks() -> Vec<(String, u64, u64)> {
    let disks = Disks::new_with_refreshed_list();
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for disk in disks.list() {
        if is_pseudo_filesystem(disk.file_system()) {
            continue;
        }
        let device = disk.name().to_string_lossy().to_string();
        if seen.insert(device.clone()) {
            result.push((device, disk.total_space(), disk.available_space()));
        }
    }
    result
}

fn is_pseudo_filesystem(fs: &OsStr) -> bool {
    let fs = fs.to_string_lossy();
    EXCLUDED_FILESYSTEMS
        .iter()
        .any(|excluded| fs.eq_ignore_ascii_case(excluded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_cached_and_stable() {
        let sampler = MetricsSampler::new();
        let first = sampler.memory_total_bytes();
        let second = sampler.memory_total_bytes();
        assert_eq!(first, second);
        assert!(first > 0);
    }

    #[test]
    fn used_memory_never_exceeds_total() {
        let sampler = MetricsSampler::new();
        assert!(sampler.memory_used_bytes() <= sampler.memory_total_bytes());
    }

    #[test]
    fn cpu_sampling_returns_without_delay() {
        let sampler = MetricsSampler::new();
        let started = std::time::Instant::now();
        let usage = sampler.cpu_usage_percent();
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
        assert!((0.0..=100.0 * num_cpus_upper_bound()).contains(&usage));
    }

    #[test]
    fn pseudo_filesystems_are_excluded() {
        assert!(is_pseudo_filesystem(OsStr::new("tmpfs")));
        assert!(is_pseudo_filesystem(OsStr::new("overlay")));
        assert!(!is_pseudo_filesystem(OsStr::new("ext4")));
        assert!(!is_pseudo_filesystem(OsStr::new("xfs")));
    }

    #[test]
    fn uptime_is_monotonic_positive() {
        let sampler = MetricsSampler::new();
        assert!(sampler.uptime_seconds() > 0);
    }

    fn num_cpus_upper_bound() -> f64 {
        std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0)
    }
}
