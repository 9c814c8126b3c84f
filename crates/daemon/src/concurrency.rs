//! Concurrency planning
//!
//! Derives the number of encode slots from configuration, the detected
//! hardware and the CPU core count.

use crate::config::Config;
use crate::hardware::HardwareProfile;

/// Hosts at or above this many logical cores run two software encodes
const SOFTWARE_PARALLEL_CORES: u32 = 16;

/// Slot plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Whether a hardware encoder was detected
    pub hardware: bool,
    /// Maximum number of concurrent encoding jobs
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a plan with the detected core count
    pub fn derive(cfg: &Config, profile: &HardwareProfile) -> Self {
        Self::derive_with_cores(cfg, profile, num_cpus::get() as u32)
    }

    /// Uses the explicit `max_concurrent_jobs` when non-zero. Otherwise a
    /// hardware encoder gets 2 slots and software hosts get 1 below 16 cores
    /// and 2 from 16 up.
    pub fn derive_with_cores(cfg: &Config, profile: &HardwareProfile, total_cores: u32) -> Self {
        let hardware = profile.is_hardware();
        let max_concurrent_jobs = if cfg.worker.max_concurrent_jobs > 0 {
            cfg.worker.max_concurrent_jobs
        } else {
            derive_max_jobs(hardware, total_cores)
        };

        Self {
            total_cores,
            hardware,
            max_concurrent_jobs,
        }
    }
}

fn derive_max_jobs(hardware: bool, cores: u32) -> u32 {
    if hardware || cores >= SOFTWARE_PARALLEL_CORES {
        2
    } else {
        1
    }
}

pub fn derive_plan(cfg: &Config, profile: &HardwareProfile) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg, profile)
}
