use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::alerting::EvaluationOptions;
use crate::db::models::{Condition, CreateAlertRuleRequest, MetricKind};
use crate::scheduler::{MonitoringTargetConfig, SchedulerSettings};

const ENV_PREFIX: &str = "PULSEWATCH_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub log_dir: String,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub log_filter: String,
    pub scheduler: SchedulerConfig,
    pub alerting: AlertingConfig,
    pub targets: Vec<TargetConfig>,
    pub rules: Vec<RuleConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,
    #[serde(default = "default_max_concurrent_tests")]
    pub max_concurrent_tests: usize,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: default_interval_ms(),
            max_concurrent_tests: default_max_concurrent_tests(),
            max_failures: default_max_failures(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            default_interval: Duration::from_millis(self.default_interval_ms),
            max_concurrent_tests: self.max_concurrent_tests,
            max_failures: self.max_failures,
            default_timeout: Duration::from_millis(self.default_timeout_ms),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AlertingConfig {
    #[serde(default = "default_true")]
    pub outage_incidents: bool,
    #[serde(default = "default_queue_capacity")]
    pub evaluation_queue_capacity: usize,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            outage_incidents: true,
            evaluation_queue_capacity: default_queue_capacity(),
        }
    }
}

impl AlertingConfig {
    pub fn options(&self) -> EvaluationOptions {
        EvaluationOptions {
            queue_capacity: self.evaluation_queue_capacity,
            outage_incidents: self.outage_incidents,
        }
    }
}

/// A `[[targets]]` entry.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TargetConfig {
    pub id: String,
    pub url: String,
    /// `0` or absent uses `scheduler.default_interval_ms`.
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_failures: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TargetConfig {
    pub fn monitoring_config(&self) -> MonitoringTargetConfig {
        MonitoringTargetConfig {
            enabled: self.enabled,
            max_failures: self.max_failures,
            timeout_ms: self.timeout_ms,
            ..MonitoringTargetConfig::new(self.id.clone(), self.interval_ms)
        }
    }
}

/// A `[[rules]]` entry, seeded into the rule store at startup.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RuleConfig {
    pub target_id: String,
    pub metric: MetricKind,
    pub condition: Condition,
    pub threshold: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RuleConfig {
    pub fn request(&self) -> CreateAlertRuleRequest {
        CreateAlertRuleRequest {
            target_id: self.target_id.clone(),
            metric: self.metric,
            condition: self.condition,
            threshold: self.threshold,
            enabled: Some(self.enabled),
        }
    }
}

// File layer
#[derive(Deserialize, Default, Debug)]
struct PartialAppConfig {
    log_dir: Option<String>,
    log_filter: Option<String>,
    scheduler: Option<SchedulerConfig>,
    alerting: Option<AlertingConfig>,
    #[serde(default)]
    targets: Vec<TargetConfig>,
    #[serde(default)]
    rules: Vec<RuleConfig>,
}

// Environment layer, flat `PULSEWATCH_*` variables
#[derive(Deserialize, Default, Debug)]
struct EnvOverrides {
    log_dir: Option<String>,
    log_filter: Option<String>,
    default_interval_ms: Option<u64>,
    max_concurrent_tests: Option<usize>,
    max_failures: Option<u32>,
    default_timeout_ms: Option<u64>,
    outage_incidents: Option<bool>,
    evaluation_queue_capacity: Option<usize>,
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_filter() -> String {
    "info,pulsewatch=debug".to_string()
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_max_concurrent_tests() -> usize {
    5
}

fn default_max_failures() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Loads `.env`, the optional TOML file, then `PULSEWATCH_*` overrides.
    /// A missing file is not an error.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let contents = match config_path {
            Some(path_str) if Path::new(path_str).exists() => {
                Some(fs::read_to_string(path_str).map_err(|source| ConfigError::Read {
                    path: path_str.to_string(),
                    source,
                })?)
            }
            _ => None,
        };
        Self::from_sources(contents.as_deref(), std::env::vars())
    }

    /// Builds the config from TOML text and an environment snapshot.
    pub fn from_sources<I>(file_contents: Option<&str>, env: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let file_config: PartialAppConfig = match file_contents {
            Some(contents) => toml::from_str(contents)?,
            None => PartialAppConfig::default(),
        };
        let env_config: EnvOverrides = envy::prefixed(ENV_PREFIX).from_iter(env)?;

        let file_scheduler = file_config.scheduler.unwrap_or_default();
        let file_alerting = file_config.alerting.unwrap_or_default();

        let config = AppConfig {
            log_dir: env_config
                .log_dir
                .or(file_config.log_dir)
                .unwrap_or_else(default_log_dir),
            log_filter: env_config
                .log_filter
                .or(file_config.log_filter)
                .unwrap_or_else(default_log_filter),
            scheduler: SchedulerConfig {
                default_interval_ms: env_config
                    .default_interval_ms
                    .unwrap_or(file_scheduler.default_interval_ms),
                max_concurrent_tests: env_config
                    .max_concurrent_tests
                    .unwrap_or(file_scheduler.max_concurrent_tests),
                max_failures: env_config
                    .max_failures
                    .unwrap_or(file_scheduler.max_failures),
                default_timeout_ms: env_config
                    .default_timeout_ms
                    .unwrap_or(file_scheduler.default_timeout_ms),
            },
            alerting: AlertingConfig {
                outage_incidents: env_config
                    .outage_incidents
                    .unwrap_or(file_alerting.outage_incidents),
                evaluation_queue_capacity: env_config
                    .evaluation_queue_capacity
                    .unwrap_or(file_alerting.evaluation_queue_capacity),
            },
            targets: file_config.targets,
            rules: file_config.rules,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let scheduler = &self.scheduler;
        if scheduler.default_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.default_interval_ms must be positive".to_string(),
            ));
        }
        if scheduler.max_concurrent_tests == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_tests must be at least 1".to_string(),
            ));
        }
        if scheduler.max_failures == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_failures must be at least 1".to_string(),
            ));
        }
        if self.alerting.evaluation_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "alerting.evaluation_queue_capacity must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.id.trim().is_empty() {
                return Err(ConfigError::Invalid("target id must not be empty".to_string()));
            }
            if target.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target {} has an empty url",
                    target.id
                )));
            }
            if !seen.insert(target.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "target {} is defined more than once",
                    target.id
                )));
            }
        }

        for rule in &self.rules {
            if !rule.threshold.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "rule for target {} has a non-finite threshold",
                    rule.target_id
                )));
            }
        }
        Ok(())
    }
}
