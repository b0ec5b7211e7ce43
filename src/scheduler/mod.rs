pub mod service;
pub mod types;

pub use service::MonitoringScheduler;
pub use types::{
    HealthState, HealthStatus, MonitoringTargetConfig, SchedulerError, SchedulerSettings,
    SchedulerStats, TargetConfigUpdate,
};
