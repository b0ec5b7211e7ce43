use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

fn default_enabled() -> bool {
    true
}

/// Scheduling state of one monitored target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringTargetConfig {
    pub target_id: String,
    /// Milliseconds between runs. `0` falls back to the scheduler's default interval.
    pub interval_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Consecutive failures before the target is disabled. `None` uses the scheduler default.
    #[serde(default)]
    pub max_failures: Option<u32>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

impl MonitoringTargetConfig {
    pub fn new(target_id: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            target_id: target_id.into(),
            interval_ms,
            enabled: true,
            max_failures: None,
            failure_count: 0,
            timeout_ms: None,
            last_run: None,
            next_run: None,
        }
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = Some(max_failures);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update applied by `update_target_config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfigUpdate {
    pub interval_ms: Option<u64>,
    pub enabled: Option<bool>,
    pub max_failures: Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub default_interval: Duration,
    pub max_concurrent_tests: usize,
    pub max_failures: u32,
    pub default_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(30),
            max_concurrent_tests: 5,
            max_failures: 3,
            default_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total_targets: usize,
    pub active_targets: usize,
    /// Targets paused individually through `pause_target`.
    pub paused_targets: usize,
    pub failed_targets: usize,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub average_run_time: f64,
    /// Milliseconds since `start`; zero while stopped.
    pub uptime: u64,
    pub is_running: bool,
    pub is_paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    pub issues: Vec<String>,
    pub last_check: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Target already scheduled: {0}")]
    DuplicateTarget(String),
    #[error("Target not found: {0}")]
    TargetNotFound(String),
    #[error("Invalid target configuration: {0}")]
    InvalidTarget(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_config_defaults_from_json() {
        let config: MonitoringTargetConfig =
            serde_json::from_str(r#"{"targetId": "t1", "intervalMs": 1000}"#).unwrap();
        assert_eq!(config, MonitoringTargetConfig::new("t1", 1000));
    }

    #[test]
    fn test_health_state_wire_names() {
        assert_eq!(serde_json::to_value(HealthState::Degraded).unwrap(), "degraded");
    }
}
