//! Scheduler tuning knobs.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default number of defragmentation actions that may be un-acknowledged.
pub const DEFAULT_MAX_OUTSTANDING_ACTIONS: usize = 8;
/// Default bound on how long `stop()` waits for the worker to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime configuration for `BalancerCommandsScheduler`.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// How long a lock acquisition may wait. Zero means a single attempt.
    pub lock_timeout: Duration,
    /// Backpressure bound for defragmentation action streams.
    pub max_outstanding_actions: usize,
    /// How long shutdown waits for the worker before aborting it.
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::ZERO,
            max_outstanding_actions: DEFAULT_MAX_OUTSTANDING_ACTIONS,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `HOLO_BALANCER_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_timeout: Duration::from_millis(read_env_u64(
                "HOLO_BALANCER_LOCK_TIMEOUT_MS",
                defaults.lock_timeout.as_millis() as u64,
            )),
            max_outstanding_actions: read_env_usize(
                "HOLO_BALANCER_MAX_OUTSTANDING_ACTIONS",
                defaults.max_outstanding_actions,
            )
            .max(1),
            stop_timeout: Duration::from_millis(read_env_u64(
                "HOLO_BALANCER_STOP_TIMEOUT_MS",
                defaults.stop_timeout.as_millis() as u64,
            )),
        }
    }
}

/// Read an env var as u64 with a default.
fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(v.trim()).ok())
        .unwrap_or(default)
}

/// Read an env var as usize with a default.
fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(v.trim()).ok())
        .unwrap_or(default)
}
