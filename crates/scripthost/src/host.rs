//! Host CPU and memory readings for the resource monitor.
//!
//! Readings come from `sysinfo`; on platforms it does not support every
//! reading is `None`.

use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, System};
use tracing::debug;

/// Used and total physical memory, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes.min(self.total_bytes) as f64 * 100.0 / self.total_bytes as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostSnapshot {
    /// Global CPU usage across all cores, 0-100.
    pub cpu_percent: Option<f32>,
    pub memory: Option<MemoryUsage>,
}

impl HostSnapshot {
    /// Sample CPU and memory.
    ///
    /// CPU usage is a delta between two refreshes, so this waits
    /// [`MINIMUM_CPU_UPDATE_INTERVAL`] between them.
    pub async fn read() -> Self {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            debug!("Host readings unsupported on this platform");
            return Self::default();
        }

        let mut system = System::new();
        system.refresh_cpu_usage();
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_usage();
        system.refresh_memory();

        let memory = MemoryUsage {
            used_bytes: system.used_memory(),
            total_bytes: system.total_memory(),
        };
        Self {
            cpu_percent: Some(system.global_cpu_usage()),
            memory: (memory.total_bytes > 0).then_some(memory),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_percent() {
        let mem = MemoryUsage {
            used_bytes: 12,
            total_bytes: 16,
        };
        assert!((mem.used_percent() - 75.0).abs() < 1e-9);

        let empty = MemoryUsage {
            used_bytes: 0,
            total_bytes: 0,
        };
        assert_eq!(empty.used_percent(), 0.0);
    }

    #[tokio::test]
    async fn reads_linux_host() {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }
        let snapshot = HostSnapshot::read().await;
        let cpu = snapshot.cpu_percent.unwrap();
        assert!((0.0..=100.0).contains(&cpu));
        let memory = snapshot.memory.unwrap();
        assert!(memory.total_bytes > 0);
        assert!((0.0..=100.0).contains(&memory.used_percent()));
    }
}
