use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::db::models::MeasurementResult;
use crate::probes::{RunOptions, RunnerError, TestRunner};

/// What a [`ScriptedRunner`] returns for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Success {
        ping: Option<f64>,
        download: Option<f64>,
    },
    /// `Ok` with a `FAILURE` result.
    Failure(String),
    /// `Err` from the runner.
    Error(String),
    Panic(String),
}

impl ScriptedOutcome {
    pub fn ping(ping: f64) -> Self {
        ScriptedOutcome::Success {
            ping: Some(ping),
            download: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub target_id: String,
    pub options: RunOptions,
    pub at: Instant,
}

#[derive(Debug)]
struct Script {
    queued: HashMap<String, VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    delays: HashMap<String, Duration>,
    calls: Vec<RecordedCall>,
}

/// Runner that plays back queued outcomes per target.
///
/// A test double: every call is recorded and kept for assertions, so it is
/// not meant for long-running use. Once a target's queue is empty every call
/// returns the fallback outcome.
#[derive(Debug)]
pub struct ScriptedRunner {
    script: Mutex<Script>,
}

impl ScriptedRunner {
    pub fn new(fallback: ScriptedOutcome) -> Self {
        Self {
            script: Mutex::new(Script {
                queued: HashMap::new(),
                fallback,
                delays: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn push(&self, target_id: &str, outcome: ScriptedOutcome) {
        self.lock()
            .queued
            .entry(target_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn push_many<I>(&self, target_id: &str, outcomes: I)
    where
        I: IntoIterator<Item = ScriptedOutcome>,
    {
        let mut script = self.lock();
        let queue = script.queued.entry(target_id.to_string()).or_default();
        queue.extend(outcomes);
    }

    pub fn set_fallback(&self, outcome: ScriptedOutcome) {
        self.lock().fallback = outcome;
    }

    /// Makes every call for `target_id` take `delay` before returning.
    pub fn set_delay(&self, target_id: &str, delay: Duration) {
        self.lock().delays.insert(target_id.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, target_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.target_id == target_id)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TestRunner for ScriptedRunner {
    async fn run(
        &self,
        target_id: &str,
        options: &RunOptions,
    ) -> Result<MeasurementResult, RunnerError> {
        let (outcome, delay) = {
            let mut script = self.lock();
            script.calls.push(RecordedCall {
                target_id: target_id.to_string(),
                options: *options,
                at: Instant::now(),
            });
            let queued = script
                .queued
                .get_mut(target_id)
                .and_then(VecDeque::pop_front);
            let outcome = queued.unwrap_or_else(|| script.fallback.clone());
            (outcome, script.delays.get(target_id).copied())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            ScriptedOutcome::Success { ping, download } => {
                Ok(MeasurementResult::success(target_id, ping, download))
            }
            ScriptedOutcome::Failure(error) => Ok(MeasurementResult::failure(target_id, error)),
            ScriptedOutcome::Error(error) => Err(RunnerError::Failed(error)),
            ScriptedOutcome::Panic(message) => panic!("{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RunOptions {
        RunOptions {
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_plays_queue_then_fallback() {
        let runner = ScriptedRunner::new(ScriptedOutcome::Error("down".to_string()));
        runner.push_many(
            "t1",
            [ScriptedOutcome::ping(20.0), ScriptedOutcome::Failure("slow".to_string())],
        );

        let first = runner.run("t1", &options()).await.unwrap();
        assert_eq!(first.ping, Some(20.0));
        let second = runner.run("t1", &options()).await.unwrap();
        assert!(!second.is_success());
        let third = runner.run("t1", &options()).await;
        assert_eq!(third, Err(RunnerError::Failed("down".to_string())));

        assert_eq!(runner.call_count("t1"), 3);
        assert_eq!(runner.call_count("t2"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_applied() {
        let runner = ScriptedRunner::new(ScriptedOutcome::ping(1.0));
        runner.set_delay("t1", Duration::from_millis(500));

        let start = Instant::now();
        runner.run("t1", &options()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
