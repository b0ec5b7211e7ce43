//! Test runners executed by the scheduler on every tick.
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::db::models::MeasurementResult;

pub mod http_probe;
pub mod scripted;

pub use http_probe::HttpProbeRunner;
pub use scripted::{ScriptedOutcome, ScriptedRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub timeout: Duration,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("Unknown target: {0}")]
    UnknownTarget(String),
    #[error("Test failed: {0}")]
    Failed(String),
    #[error("Test runner panicked: {0}")]
    Panicked(String),
}

/// Executes one test against a target.
///
/// A run that reached the target but measured a failure returns
/// `Ok` with a `FAILURE` result. `Err` means the run itself could not
/// be carried out. The scheduler counts both as failures.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(
        &self,
        target_id: &str,
        options: &RunOptions,
    ) -> Result<MeasurementResult, RunnerError>;
}
