//! Resource usage of the bus process, sampled for heartbeats.

use std::process;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tracing::warn;

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 256;

/// CPU usage warning threshold (percentage).
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 80.0;

/// One sample of process resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub pid: u32,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

impl ProcessMetrics {
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / 1024 / 1024
    }
}

/// Samples CPU and memory of the current process via `sysinfo`.
///
/// CPU usage is computed against the previous sample, so the first
/// reading after construction reports 0.
pub struct ProcessMonitor {
    system: System,
    pid: Pid,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
        }
    }

    /// Refreshes process information and returns a sample.
    pub fn sample(&mut self) -> ProcessMetrics {
        // Per-process CPU is only computed by a full refresh.
        self.system.refresh_all();

        let (memory_bytes, cpu_percent) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0));

        let metrics = ProcessMetrics {
            pid: self.pid.as_u32(),
            memory_bytes,
            cpu_percent,
        };

        if metrics.memory_mb() > HIGH_MEMORY_THRESHOLD_MB {
            warn!(
                memory_mb = metrics.memory_mb(),
                threshold_mb = HIGH_MEMORY_THRESHOLD_MB,
                "Bus memory usage above threshold"
            );
        } else if metrics.cpu_percent > HIGH_CPU_THRESHOLD_PERCENT {
            warn!(
                cpu_percent = format!("{:.1}", metrics.cpu_percent),
                threshold_percent = HIGH_CPU_THRESHOLD_PERCENT,
                "Bus CPU usage above threshold"
            );
        }

        metrics
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reports_own_process() {
        let mut monitor = ProcessMonitor::new();
        let metrics = monitor.sample();
        assert_eq!(metrics.pid, process::id());
        assert!(metrics.memory_bytes > 0);
    }

    #[test]
    fn test_memory_mb() {
        let metrics = ProcessMetrics {
            memory_bytes: 3 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(metrics.memory_mb(), 3);
    }
}
