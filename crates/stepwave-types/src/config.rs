//! Global configuration types for Stepwave.
//!
//! `GlobalConfig` represents the top-level `config.toml`; the `[engine]`
//! table tunes heartbeats, retries, leases and recovery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration. Loaded from `~/.stepwave/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Workflow engine tuning knobs. All fields have defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between heartbeat writes.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age after which a step or instance is presumed crashed.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    /// Consecutive heartbeat write failures before a timer gives up.
    #[serde(default = "default_heartbeat_failure_limit")]
    pub heartbeat_failure_limit: u32,
    /// Retry ceiling per step.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay; attempt `n` waits `base * 2^n`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Lease expiry.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// Upper bound of the random delay before a recovered instance resumes.
    #[serde(default = "default_recovery_jitter_ms")]
    pub recovery_jitter_ms: u64,
    /// Per-step evaluator timeout.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// How often status observers re-read an instance.
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
    /// How often `serve` runs the health scan (0 disables it).
    #[serde(default = "default_health_scan_interval_ms")]
    pub health_scan_interval_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_stale_threshold_ms() -> u64 {
    30_000
}

fn default_heartbeat_failure_limit() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    5_000
}

fn default_lease_ttl_ms() -> u64 {
    60_000
}

fn default_recovery_jitter_ms() -> u64 {
    2_000
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

fn default_status_poll_ms() -> u64 {
    2_000
}

fn default_health_scan_interval_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            heartbeat_failure_limit: default_heartbeat_failure_limit(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            recovery_jitter_ms: default_recovery_jitter_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            status_poll_ms: default_status_poll_ms(),
            health_scan_interval_ms: default_health_scan_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.stale_threshold(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_failure_limit, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_global_config_deserialize_empty() {
        let config: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.engine.stale_threshold_ms, 30_000);
    }

    #[test]
    fn test_global_config_partial_override() {
        let toml_str = r#"
[engine]
max_retries = 5
retry_base_delay_ms = 250
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_retries, 5);
        assert_eq!(config.engine.retry_base_delay(), Duration::from_millis(250));
        assert_eq!(config.engine.heartbeat_interval_ms, 10_000);
    }
}
