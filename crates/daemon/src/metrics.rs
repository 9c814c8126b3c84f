//! System metrics
//!
//! CPU, memory and load figures via sysinfo, bundled with the queue status
//! and detected hardware for `GET /api/system/metrics`.

use crate::events::current_timestamp_ms;
use crate::hardware::HardwareType;
use crate::manager::QueueStatus;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::System;

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Response body of the metrics endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub system: SystemMetrics,
    pub queue: QueueStatus,
    pub hardware: HardwareType,
}

fn read_metrics(sys: &mut System) -> SystemMetrics {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        mem_used_bytes: used_memory,
        mem_total_bytes: total_memory,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Collects current system metrics using a fresh sysinfo handle.
///
/// CPU usage needs two refreshes to be meaningful; prefer [`MetricsSampler`]
/// for repeated sampling.
pub fn collect_system_metrics() -> SystemMetrics {
    read_metrics(&mut System::new())
}

/// Long-lived sysinfo handle so CPU usage is measured between requests
#[derive(Debug)]
pub struct MetricsSampler {
    sys: Mutex<System>,
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        Self {
            sys: Mutex::new(sys),
        }
    }

    pub fn sample(&self) -> SystemMetrics {
        let mut sys = self.sys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        read_metrics(&mut sys)
    }

    pub fn snapshot(&self, queue: QueueStatus, hardware: HardwareType) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp_unix_ms: current_timestamp_ms(),
            system: self.sample(),
            queue,
            hardware,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_system_metrics_ranges() {
        let metrics = collect_system_metrics();
        assert!(metrics.mem_usage_percent >= 0.0 && metrics.mem_usage_percent <= 100.0);
        assert!(metrics.mem_used_bytes <= metrics.mem_total_bytes);
        assert!(metrics.load_avg_1 >= 0.0);
    }

    #[test]
    fn test_snapshot_carries_queue_and_hardware() {
        let sampler = MetricsSampler::new();
        let queue = QueueStatus {
            active_jobs: Vec::new(),
            queued_count: 1,
            running_count: 2,
            completed_count: 7,
        };
        let snapshot = sampler.snapshot(queue.clone(), HardwareType::Cpu);
        assert_eq!(snapshot.queue, queue);
        assert_eq!(snapshot.hardware, HardwareType::Cpu);
        assert!(snapshot.timestamp_unix_ms > 0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["hardware"], "cpu");
        assert!(json["system"]["cpu_usage_percent"].is_number());
        assert_eq!(json["queue"]["running_count"], 2);
    }
}
