//! Fleet policy: idle-pool sizing and resource thresholds.
//!
//! Resolution of the idle counts walks three branches in order; a later
//! branch only runs while the idle worker count is still zero:
//!
//! ```text
//! 1. secondary_infra            → nonstandard_* keys
//! 2. target == "prod"           → idle_worker_count / idle_thread_pool_count
//! 3. otherwise                  → nonstandard_* keys, defaults 4 / 2
//! ```

use std::time::Duration;

use tracing::debug;

use crate::config::{
    DEFAULT_CPU_THRESHOLD, DEFAULT_IDLE_TIMEOUT_MINUTES, DEFAULT_MEM_THRESHOLD, FleetConfig,
};

pub const DEFAULT_IDLE_TARGET_COUNT: u32 = 4;
pub const DEFAULT_IDLE_THREAD_POOL_COUNT: u32 = 2;

/// Resolved pool sizing and threshold parameters for one deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetPolicy {
    /// Number of idle workers the pool is kept at.
    pub idle_target_count: u32,
    pub idle_thread_pool_count: u32,
    pub cpu_threshold_pct: f64,
    pub mem_threshold_pct: f64,
    /// Skip the CPU/memory check before growing the pool.
    pub threshold_check_disabled: bool,
    /// Idle time after which an excess worker may be retired.
    pub idle_timeout_minutes: u64,
}

impl FleetPolicy {
    /// Resolve the policy from configuration. Pure and deterministic.
    pub fn resolve(config: &FleetConfig) -> Self {
        let pool = &config.pool;
        let mut idle_target_count = 0;
        let mut idle_thread_pool_count = 0;

        if config.deployment.secondary_infra {
            if let Some(n) = pool.nonstandard_idle_worker_count {
                idle_target_count = n;
            }
            if let Some(n) = pool.nonstandard_idle_thread_pool_count {
                idle_thread_pool_count = n;
            }
        }

        if idle_target_count == 0 && config.deployment.target.as_deref() == Some("prod") {
            if let Some(n) = pool.idle_worker_count {
                idle_target_count = n;
            }
            if let Some(n) = pool.idle_thread_pool_count {
                idle_thread_pool_count = n;
            }
        }

        if idle_target_count == 0 {
            idle_target_count = pool
                .nonstandard_idle_worker_count
                .unwrap_or(DEFAULT_IDLE_TARGET_COUNT);
            idle_thread_pool_count = pool
                .nonstandard_idle_thread_pool_count
                .unwrap_or(DEFAULT_IDLE_THREAD_POOL_COUNT);
        }

        let policy = Self {
            idle_target_count,
            idle_thread_pool_count,
            cpu_threshold_pct: config
                .thresholds
                .cpu_percent
                .unwrap_or(DEFAULT_CPU_THRESHOLD),
            mem_threshold_pct: config
                .thresholds
                .mem_percent
                .unwrap_or(DEFAULT_MEM_THRESHOLD),
            threshold_check_disabled: config.thresholds.disabled,
            idle_timeout_minutes: pool
                .idle_timeout_minutes
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_MINUTES),
        };
        debug!(?policy, "fleet policy resolved");
        policy
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes.saturating_mul(60))
    }
}

impl Default for FleetPolicy {
    fn default() -> Self {
        Self::resolve(&FleetConfig::default())
    }
}
